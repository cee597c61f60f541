//! Restore streamer: serves table extents out of a segment data stream.
//!
//! Single-shot mode serves one extent per process from an inherited stream.
//! The resident agent owns the segment data file and serves every extent in
//! ledger order, one named pipe per table.

use std::fs::File;
use std::io::Seek;

use crate::config::{AgentConfig, SingleShotConfig};
use crate::copy::{discard_then_copy, CopyReport};
use crate::error::StreamError;
use crate::extent::{Extent, ServePlan, TableId};
use crate::ledger::Ledger;
use crate::pipes::{self, WriterOpen};

/// Position a stream is assumed to be at, given the table served just before.
pub fn assumed_position(
    ledger: &Ledger,
    previous_table_id: Option<TableId>,
) -> Result<u64, StreamError> {
    match previous_table_id {
        None => Ok(0),
        Some(id) => ledger
            .lookup(id)
            .map(|extent| extent.end)
            .ok_or(StreamError::MissingExtent(id)),
    }
}

/// Where serving starts: the descriptor's own offset when it has one,
/// otherwise the end of the previous table's extent.
///
/// A file handle freshly opened by this process sits at 0 whatever the
/// previous table was, so a mismatch there is only logged.
pub fn start_position(
    file_offset: Option<u64>,
    previous_end: impl FnOnce() -> Result<u64, StreamError>,
) -> Result<u64, StreamError> {
    let Some(offset) = file_offset else {
        return previous_end();
    };
    match previous_end() {
        Ok(assumed) if assumed != offset => tracing::debug!(
            offset,
            assumed,
            "file offset differs from previous table's end; using file offset"
        ),
        Ok(_) => {}
        Err(err) => tracing::debug!(offset, error = %err, "previous table not in ledger"),
    }
    Ok(offset)
}

/// Serve one table's extent from `source` to `dest`.
///
/// A regular-file source reports its own offset, so each invocation works
/// whether it got a fresh handle or one shared with earlier invocations. Any
/// other source is assumed to sit at the end of the previous table's extent.
pub fn serve_single_table(
    config: &SingleShotConfig,
    source: &mut File,
    dest: &mut File,
) -> Result<CopyReport, StreamError> {
    let ledger = Ledger::load(&config.toc_path)?;
    let extent = *ledger
        .lookup(config.table_id)
        .ok_or(StreamError::MissingExtent(config.table_id))?;

    let file_offset = if source.metadata()?.is_file() {
        Some(source.stream_position()?)
    } else {
        None
    };
    let position = start_position(file_offset, || {
        assumed_position(&ledger, config.previous_table_id)
    })?;
    let plan = ServePlan::new(position, &extent)?;
    tracing::debug!(
        content = config.content_id,
        table_id = config.table_id,
        discard = plan.discard,
        copy = plan.copy,
        "copying bytes for table"
    );
    let report = config
        .copier
        .discard_and_copy(source, plan.discard, plan.copy, dest)?;
    tracing::debug!(
        content = config.content_id,
        table_id = config.table_id,
        "finished copying bytes for table"
    );
    Ok(report)
}

/// What a resident agent did over one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    pub served: usize,
    pub skipped: usize,
    pub broken: usize,
    /// Final byte position in the data file.
    pub position: u64,
}

/// Long-lived per-segment streamer.
#[derive(Debug)]
pub struct ResidentAgent {
    config: AgentConfig,
    ledger: Ledger,
}

impl ResidentAgent {
    pub fn open(config: AgentConfig) -> Result<Self, StreamError> {
        let ledger = Ledger::load(&config.toc_path)?;
        Ok(Self { config, ledger })
    }

    /// Extents this agent will serve, in stream order.
    pub fn planned_extents(&self) -> Vec<Extent> {
        self.ledger
            .ordered_extents()
            .iter()
            .filter(|extent| self.config.serves(extent.table_id))
            .copied()
            .collect()
    }

    /// Make sure every planned table has its FIFO and no stale skip marker,
    /// then announce readiness in the pipe directory.
    pub fn prepare_pipes(&self) -> std::io::Result<()> {
        let tables: Vec<TableId> = self
            .planned_extents()
            .iter()
            .map(|extent| extent.table_id)
            .collect();
        pipes::create_table_pipes(&self.config.pipe_dir, &tables)?;
        pipes::mark_ready(&self.config.pipe_dir)
    }

    /// Serve every planned extent. Broken pipes are logged and skipped over;
    /// any other error stops the agent.
    pub fn run(&self) -> Result<AgentSummary, StreamError> {
        let content = self.config.content_id;
        let mut source = File::open(&self.config.data_file)?;
        let mut summary = AgentSummary::default();

        for extent in self.planned_extents() {
            let pipe = pipes::pipe_path(&self.config.pipe_dir, extent.table_id);
            let marker = pipes::skip_marker_path(&self.config.pipe_dir, extent.table_id);
            let plan = ServePlan::new(summary.position, &extent)?;
            tracing::debug!(
                content,
                table_id = extent.table_id,
                start = extent.start,
                end = extent.end,
                position = summary.position,
                "waiting for table reader"
            );

            let mut dest = match pipes::open_writer(&pipe, &marker, self.config.reader_wait)? {
                WriterOpen::Attached(dest) => dest,
                WriterOpen::Skipped => {
                    // Drain the unused bytes so the position tracks the ledger.
                    let report = discard_then_copy(
                        &mut source,
                        plan.consumed(),
                        0,
                        &mut std::io::sink(),
                    )?;
                    summary.position += report.consumed();
                    summary.skipped += 1;
                    tracing::info!(content, table_id = extent.table_id, "table skipped");
                    continue;
                }
            };

            match discard_then_copy(&mut source, plan.discard, plan.copy, &mut dest) {
                Ok(report) => {
                    summary.position += report.consumed();
                    summary.served += 1;
                    tracing::debug!(
                        content,
                        table_id = extent.table_id,
                        discarded = report.discarded,
                        copied = report.copied,
                        "table served"
                    );
                }
                Err(StreamError::BrokenPipe { consumed }) => {
                    // The next discard skips whatever is left of this extent.
                    summary.position += consumed;
                    summary.broken += 1;
                    tracing::warn!(
                        content,
                        table_id = extent.table_id,
                        consumed,
                        "reader closed pipe early; continuing with next table"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        content,
                        table_id = extent.table_id,
                        error = %err,
                        "serving table failed"
                    );
                    return Err(err);
                }
            }
            drop(dest);
            std::thread::sleep(self.config.reopen_delay);
        }

        tracing::info!(
            content,
            served = summary.served,
            skipped = summary.skipped,
            broken = summary.broken,
            "agent finished"
        );
        Ok(summary)
    }
}
