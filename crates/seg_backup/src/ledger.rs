//! Append-only extent ledger (segment table of contents).
//!
//! The ledger records, for one segment and one backup run, which byte range of
//! the shared data file belongs to which table. It is written by the backup
//! relay once per table and only read during restore.
//!
//! On-disk layout: an 8-byte magic header followed by length-prefixed records
//! with a CRC32 checksum, in write order. Each record carries the table id and
//! the extent bounds; the `end` of the last record is the cursor. A trailing
//! record cut short by a crash is ignored on load and overwritten by the next
//! append.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;

use crate::error::LedgerError;
use crate::extent::{Extent, TableId};

/// Magic bytes at the start of every ledger file.
const LEDGER_MAGIC: &[u8; 8] = b"SEGTOC01";
/// Encoded size of one record payload.
const RECORD_PAYLOAD_LEN: usize = 4 + 8 + 8;
/// Encoded size of one record including its length and checksum prefix.
const RECORD_LEN: u64 = (4 + 4 + RECORD_PAYLOAD_LEN) as u64;

/// How an append is made durable before it is acknowledged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    None,
    Data,
    #[default]
    All,
}

impl SyncMode {
    /// Parse a sync mode name. Unknown names map to the safest mode.
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "none" | "buffer" => SyncMode::None,
            "sync_data" => SyncMode::Data,
            _ => SyncMode::All,
        }
    }

    fn sync(self, file: &File) -> std::io::Result<()> {
        match self {
            SyncMode::None => Ok(()),
            SyncMode::Data => file.sync_data(),
            SyncMode::All => file.sync_all(),
        }
    }
}

/// Extent ledger for one segment.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    extents: Vec<Extent>,
    index: HashMap<TableId, usize>,
    cursor: u64,
    /// Length of the valid prefix of the file; anything past it is a torn tail.
    valid_len: u64,
    sync_mode: SyncMode,
}

impl Ledger {
    /// Load a persisted ledger. A missing file is reported as `NotFound`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(LedgerError::NotFound(path))
            }
            Err(err) => return Err(LedgerError::io(path, err)),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| LedgerError::io(&path, err))?;
        Self::decode(path, &buf)
    }

    /// Load a persisted ledger, or start an empty one when none exists yet.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        match Self::load(path.as_ref()) {
            Ok(ledger) => Ok(ledger),
            Err(LedgerError::NotFound(path)) => {
                tracing::debug!(path = %path.display(), "no ledger yet, starting empty");
                Ok(Self::empty(path))
            }
            Err(err) => Err(err),
        }
    }

    /// An empty ledger that will be created at `path` on the first append.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            extents: Vec::new(),
            index: HashMap::new(),
            cursor: 0,
            valid_len: 0,
            sync_mode: SyncMode::default(),
        }
    }

    /// Durability applied to every later `add`.
    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// File this ledger is persisted to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes recorded so far; the next extent must start here.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Number of recorded extents.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Append an extent and persist it before updating the cursor.
    ///
    /// Fails without touching the file when `start` is not the cursor.
    pub fn add(&mut self, table_id: TableId, start: u64, end: u64) -> Result<(), LedgerError> {
        if start != self.cursor {
            return Err(LedgerError::OrderingViolation {
                table_id,
                start,
                cursor: self.cursor,
            });
        }
        if end < start {
            return Err(LedgerError::InvertedExtent {
                table_id,
                start,
                end,
            });
        }
        if self.index.contains_key(&table_id) {
            return Err(LedgerError::DuplicateTable(table_id));
        }

        let extent = Extent::new(table_id, start, end);
        self.persist(&extent)?;

        self.index.insert(table_id, self.extents.len());
        self.extents.push(extent);
        self.cursor = end;
        self.valid_len = self.valid_len.max(LEDGER_MAGIC.len() as u64) + RECORD_LEN;
        Ok(())
    }

    /// Extents in ascending start order, which is the order they were written.
    pub fn ordered_extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Extent recorded for `table_id`, if the table was backed up.
    pub fn lookup(&self, table_id: TableId) -> Option<&Extent> {
        self.index.get(&table_id).map(|idx| &self.extents[*idx])
    }

    /// JSON rendering of the ledger for operators.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "path": self.path.display().to_string(),
            "cursor": self.cursor,
            "extents": self.extents,
        })
    }

    fn persist(&self, extent: &Extent) -> Result<(), LedgerError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|err| LedgerError::io(&self.path, err))?;
        let io = |err| LedgerError::io(&self.path, err);

        if self.valid_len == 0 {
            // Fresh file, or one whose header never made it to disk.
            file.set_len(0).map_err(io)?;
            file.write_all(LEDGER_MAGIC).map_err(io)?;
        } else {
            // Drop any torn tail left by an interrupted append.
            file.set_len(self.valid_len).map_err(io)?;
            file.seek(SeekFrom::Start(self.valid_len)).map_err(io)?;
        }
        write_record(&mut file, extent).map_err(io)?;
        file.flush().map_err(io)?;
        self.sync_mode.sync(&file).map_err(io)?;
        Ok(())
    }

    fn decode(path: PathBuf, buf: &[u8]) -> Result<Self, LedgerError> {
        let mut ledger = Self::empty(path);
        if buf.len() < LEDGER_MAGIC.len() {
            if LEDGER_MAGIC.starts_with(buf) {
                // Crashed while writing the header: nothing was ever recorded.
                return Ok(ledger);
            }
            return Err(ledger.corrupt(0, "bad magic header"));
        }
        if &buf[..LEDGER_MAGIC.len()] != LEDGER_MAGIC {
            return Err(ledger.corrupt(0, "bad magic header"));
        }

        let mut offset = LEDGER_MAGIC.len();
        loop {
            let remaining = buf.len() - offset;
            if (remaining as u64) < RECORD_LEN {
                if remaining > 0 {
                    tracing::warn!(
                        path = %ledger.path.display(),
                        offset,
                        trailing = remaining,
                        "ignoring truncated trailing ledger record"
                    );
                }
                break;
            }
            let len = read_u32_at(buf, offset) as usize;
            if len != RECORD_PAYLOAD_LEN {
                return Err(ledger.corrupt(offset as u64, format!("record length {len}")));
            }
            let expected_crc = read_u32_at(buf, offset + 4);
            let payload = &buf[offset + 8..offset + 8 + len];
            let mut hasher = Hasher::new();
            hasher.update(payload);
            if hasher.finalize() != expected_crc {
                return Err(ledger.corrupt(offset as u64, "checksum mismatch"));
            }
            let extent = decode_payload(payload);
            ledger.replay(extent, offset as u64)?;
            offset += RECORD_LEN as usize;
        }
        ledger.valid_len = offset as u64;
        Ok(ledger)
    }

    fn replay(&mut self, extent: Extent, offset: u64) -> Result<(), LedgerError> {
        if extent.start != self.cursor || extent.end < extent.start {
            return Err(self.corrupt(
                offset,
                format!(
                    "table {} extent [{}, {}) does not continue cursor {}",
                    extent.table_id, extent.start, extent.end, self.cursor
                ),
            ));
        }
        if self.index.contains_key(&extent.table_id) {
            return Err(self.corrupt(offset, format!("duplicate table {}", extent.table_id)));
        }
        self.index.insert(extent.table_id, self.extents.len());
        self.extents.push(extent);
        self.cursor = extent.end;
        Ok(())
    }

    fn corrupt(&self, offset: u64, reason: impl Into<String>) -> LedgerError {
        LedgerError::Corrupt {
            path: self.path.clone(),
            offset,
            reason: reason.into(),
        }
    }
}

/// Write a single length-prefixed record with CRC32 checksum.
fn write_record(file: &mut File, extent: &Extent) -> std::io::Result<()> {
    let payload = encode_payload(extent);
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();
    let mut record = Vec::with_capacity(RECORD_LEN as usize);
    record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    record.extend_from_slice(&checksum.to_be_bytes());
    record.extend_from_slice(&payload);
    file.write_all(&record)
}

fn encode_payload(extent: &Extent) -> [u8; RECORD_PAYLOAD_LEN] {
    let mut out = [0u8; RECORD_PAYLOAD_LEN];
    out[..4].copy_from_slice(&extent.table_id.to_be_bytes());
    out[4..12].copy_from_slice(&extent.start.to_be_bytes());
    out[12..].copy_from_slice(&extent.end.to_be_bytes());
    out
}

fn decode_payload(payload: &[u8]) -> Extent {
    let mut table_id = [0u8; 4];
    table_id.copy_from_slice(&payload[..4]);
    let mut start = [0u8; 8];
    start.copy_from_slice(&payload[4..12]);
    let mut end = [0u8; 8];
    end.copy_from_slice(&payload[12..20]);
    Extent::new(
        u32::from_be_bytes(table_id),
        u64::from_be_bytes(start),
        u64::from_be_bytes(end),
    )
}

fn read_u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(raw)
}
