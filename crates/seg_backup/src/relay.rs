//! Backup relay: passes one table's export through to the segment data stream
//! and records the resulting extent.

use std::fs::File;
use std::io::{Read, Write};

use crate::config::RelayConfig;
use crate::error::StreamError;
use crate::extent::Extent;
use crate::ledger::Ledger;

/// Copy `input` to `output` until end of stream, then record the extent.
///
/// The ledger is only updated after every byte has been written and synced,
/// so a failed relay never leaves an extent without backing bytes.
pub fn relay_table<R: Read + ?Sized>(
    config: &RelayConfig,
    input: &mut R,
    output: &mut File,
) -> Result<Extent, StreamError> {
    let mut ledger = Ledger::load_or_create(&config.toc_path)?.with_sync_mode(config.sync_mode);
    let start = ledger.cursor();

    let written = std::io::copy(input, output)?;
    output.flush()?;
    // Pipes reject fsync; only a regular file can be made durable here.
    if output.metadata()?.is_file() {
        output.sync_data()?;
    }

    let end = start + written;
    ledger.add(config.table_id, start, end)?;
    tracing::info!(
        content = config.content_id,
        table_id = config.table_id,
        start,
        end,
        "recorded table extent"
    );
    Ok(Extent::new(config.table_id, start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerError;
    use crate::ledger::SyncMode;
    use std::fs::OpenOptions;
    use std::io::Cursor;

    fn config(dir: &tempfile::TempDir, table_id: u32) -> RelayConfig {
        RelayConfig {
            content_id: 0,
            table_id,
            toc_path: dir.path().join("toc"),
            sync_mode: SyncMode::Data,
        }
    }

    #[test]
    fn consecutive_relays_append_contiguous_extents() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("data");
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .unwrap();

        let first = relay_table(&config(&dir, 1), &mut Cursor::new(vec![1u8; 100]), &mut out)
            .unwrap();
        let second = relay_table(&config(&dir, 2), &mut Cursor::new(vec![2u8; 150]), &mut out)
            .unwrap();

        assert_eq!(first, Extent::new(1, 0, 100));
        assert_eq!(second, Extent::new(2, 100, 250));
        assert_eq!(std::fs::metadata(&data_path).unwrap().len(), 250);
        let ledger = Ledger::load(dir.path().join("toc")).unwrap();
        assert_eq!(ledger.cursor(), 250);
    }

    #[test]
    fn empty_export_records_empty_extent() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = tempfile::tempfile().unwrap();
        let extent = relay_table(&config(&dir, 5), &mut Cursor::new(Vec::new()), &mut out).unwrap();
        assert!(extent.is_empty());
        assert_eq!(
            Ledger::load(dir.path().join("toc"))
                .unwrap()
                .lookup(5)
                .copied(),
            Some(Extent::new(5, 0, 0))
        );
    }

    #[test]
    fn failed_relay_does_not_touch_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = tempfile::tempfile().unwrap();
        relay_table(&config(&dir, 1), &mut Cursor::new(vec![0u8; 10]), &mut out).unwrap();
        let before = std::fs::read(dir.path().join("toc")).unwrap();

        // Read-only handle: the write fails before anything is recorded.
        let ro_path = dir.path().join("ro");
        std::fs::write(&ro_path, b"").unwrap();
        let mut read_only = File::open(&ro_path).unwrap();
        let err = relay_table(&config(&dir, 2), &mut Cursor::new(vec![0u8; 10]), &mut read_only)
            .unwrap_err();
        assert!(matches!(err, StreamError::Io(_)));
        assert_eq!(std::fs::read(dir.path().join("toc")).unwrap(), before);
    }

    #[test]
    fn duplicate_table_is_refused_after_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = tempfile::tempfile().unwrap();
        relay_table(&config(&dir, 1), &mut Cursor::new(vec![0u8; 10]), &mut out).unwrap();
        let err = relay_table(&config(&dir, 1), &mut Cursor::new(vec![0u8; 10]), &mut out)
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Ledger(LedgerError::DuplicateTable(1))
        ));
    }
}
