//! Per-process configuration for the segment helpers.
//!
//! Each helper builds exactly one of these at start-up from its command line
//! and passes it down; nothing below the binaries reads flags or env vars.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::copy::{DiscardAndCopy, InProcessCopier};
use crate::extent::TableId;
use crate::ledger::SyncMode;
use crate::pipes::ReaderWait;

/// Content id used when a helper was started without one.
pub const UNKNOWN_CONTENT: i32 = -2;
/// Pause between closing one table's pipe and opening the next.
pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_millis(100);

/// Backup relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub content_id: i32,
    pub table_id: TableId,
    pub toc_path: PathBuf,
    pub sync_mode: SyncMode,
}

/// Single-shot restore settings.
#[derive(Clone)]
pub struct SingleShotConfig {
    pub content_id: i32,
    pub toc_path: PathBuf,
    pub table_id: TableId,
    /// Table served by the previous invocation on the same stream, if any.
    pub previous_table_id: Option<TableId>,
    pub copier: Arc<dyn DiscardAndCopy>,
}

impl std::fmt::Debug for SingleShotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleShotConfig")
            .field("content_id", &self.content_id)
            .field("toc_path", &self.toc_path)
            .field("table_id", &self.table_id)
            .field("previous_table_id", &self.previous_table_id)
            .finish_non_exhaustive()
    }
}

impl SingleShotConfig {
    pub fn in_process(
        content_id: i32,
        toc_path: impl Into<PathBuf>,
        table_id: TableId,
        previous_table_id: Option<TableId>,
    ) -> Self {
        Self {
            content_id,
            toc_path: toc_path.into(),
            table_id,
            previous_table_id,
            copier: Arc::new(InProcessCopier),
        }
    }
}

/// Resident agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub content_id: i32,
    pub toc_path: PathBuf,
    pub data_file: PathBuf,
    pub pipe_dir: PathBuf,
    /// Tables to serve; `None` serves every extent in the ledger.
    pub include_tables: Option<BTreeSet<TableId>>,
    pub reopen_delay: Duration,
    pub reader_wait: ReaderWait,
}

impl AgentConfig {
    pub fn new(
        content_id: i32,
        toc_path: impl Into<PathBuf>,
        data_file: impl Into<PathBuf>,
        pipe_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            content_id,
            toc_path: toc_path.into(),
            data_file: data_file.into(),
            pipe_dir: pipe_dir.into(),
            include_tables: None,
            reopen_delay: DEFAULT_REOPEN_DELAY,
            reader_wait: ReaderWait::default(),
        }
    }

    pub fn serves(&self, table_id: TableId) -> bool {
        self.include_tables
            .as_ref()
            .map_or(true, |tables| tables.contains(&table_id))
    }
}

/// Parse a comma-separated table id list such as `3,17,42`.
pub fn parse_table_ids(raw: &str) -> anyhow::Result<BTreeSet<TableId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<TableId>()
                .with_context(|| format!("invalid table id {part:?}"))
        })
        .collect()
}

/// Files and directories of one segment, as seen by the host running its agent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SegmentLayout {
    pub content_id: i32,
    pub toc_path: PathBuf,
    pub data_file: PathBuf,
    pub pipe_dir: PathBuf,
    /// Per-table data files, for backups taken one file per table.
    #[serde(default)]
    pub table_files: Vec<PathBuf>,
}

/// Segment layout manifest for a single-data-file restore.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClusterLayout {
    pub segments: Vec<SegmentLayout>,
}

impl ClusterLayout {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read segment layout {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse segment layout {}", path.display()))
    }
}
