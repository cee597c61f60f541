//! Progress events emitted as tables finish restoring.

use crate::task::TableRestoreTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOutcome {
    Restored,
    Failed(String),
}

/// Receives one event per finished table, successful or not.
pub trait ProgressSink: Send + Sync {
    fn table_finished(
        &self,
        completed: usize,
        total: usize,
        task: &TableRestoreTask,
        outcome: &TableOutcome,
    );
}

/// Logs progress through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn table_finished(
        &self,
        completed: usize,
        total: usize,
        task: &TableRestoreTask,
        outcome: &TableOutcome,
    ) {
        match outcome {
            TableOutcome::Restored => tracing::info!(
                table = %task.schema_qualified_name,
                "tables restored: {completed}/{total}"
            ),
            TableOutcome::Failed(reason) => tracing::warn!(
                table = %task.schema_qualified_name,
                reason = %reason,
                "tables restored: {completed}/{total} (table failed)"
            ),
        }
    }
}
