//! Supervision of the per-segment resident streamer agents.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterLayout, SegmentLayout};
use crate::error::RestoreError;
use crate::extent::TableId;
use crate::ledger::Ledger;
use crate::pipes;
use crate::scheduler::DataLayout;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Segment-side collaborators of a restore.
#[async_trait]
pub trait SegmentAgents: Send + Sync {
    /// Check every segment holds the expected number of backup files for
    /// `layout`.
    async fn verify_backup_file_count(
        &self,
        layout: DataLayout,
        expected: usize,
    ) -> Result<(), RestoreError>;

    /// Start one agent per segment serving `tables`, and return once every
    /// agent is running and its pipes exist.
    ///
    /// Returns `tables` in the order the agents will serve them; imports must
    /// be issued in that order.
    async fn start(&self, tables: &[TableId]) -> Result<Vec<TableId>, RestoreError>;

    /// Tell every agent to drop `table_id`'s extent instead of serving it.
    async fn skip_table(&self, table_id: TableId) -> Result<(), RestoreError>;

    /// Resolves when an agent dies; never resolves while all are healthy.
    async fn failed(&self) -> RestoreError {
        std::future::pending().await
    }

    /// Stop all agents and remove their pipes.
    async fn teardown(&self) -> Result<(), RestoreError>;
}

/// Runs agents as local `streamer --restore --agent` processes, one per
/// segment of a [`ClusterLayout`].
pub struct LocalAgentSupervisor {
    streamer: PathBuf,
    layout: ClusterLayout,
    extra_args: Vec<String>,
    startup_timeout: Duration,
    state: Mutex<SupervisorState>,
    failure_tx: watch::Sender<Option<String>>,
}

#[derive(Default)]
struct SupervisorState {
    tables: Vec<TableId>,
    monitors: Vec<JoinHandle<()>>,
    shutdown: Option<CancellationToken>,
}

impl LocalAgentSupervisor {
    pub fn new(streamer: impl Into<PathBuf>, layout: ClusterLayout) -> Self {
        let (failure_tx, _) = watch::channel(None);
        Self {
            streamer: streamer.into(),
            layout,
            extra_args: Vec::new(),
            startup_timeout: Duration::from_secs(10),
            state: Mutex::new(SupervisorState::default()),
            failure_tx,
        }
    }

    /// Extra arguments appended to every agent command line.
    pub fn with_agent_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    /// How long `start` waits for every agent to report ready.
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Order in which every segment's ledger puts `tables`.
    ///
    /// Segments back tables up independently, so they must agree; a table
    /// missing from any ledger could never be served.
    fn serve_order(&self, tables: &[TableId]) -> Result<Vec<TableId>, RestoreError> {
        let wanted: HashSet<TableId> = tables.iter().copied().collect();
        let mut agreed: Option<(i32, Vec<TableId>)> = None;
        for segment in &self.layout.segments {
            let content = segment.content_id;
            let ledger = Ledger::load(&segment.toc_path)
                .map_err(|err| RestoreError::Agent(format!("segment {content}: {err}")))?;
            let served: Vec<TableId> = ledger
                .ordered_extents()
                .iter()
                .map(|extent| extent.table_id)
                .filter(|id| wanted.contains(id))
                .collect();
            if served.len() != wanted.len() {
                let mut missing: Vec<TableId> = wanted
                    .iter()
                    .copied()
                    .filter(|id| ledger.lookup(*id).is_none())
                    .collect();
                missing.sort_unstable();
                return Err(RestoreError::Agent(format!(
                    "segment {content}: tables {missing:?} not in ledger"
                )));
            }
            match &agreed {
                None => agreed = Some((content, served)),
                Some((first, order)) if *order != served => {
                    return Err(RestoreError::Agent(format!(
                        "segment {content} backed tables up in a different order than segment {first}"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(agreed.map_or_else(|| tables.to_vec(), |(_, order)| order))
    }

    /// Wait until every agent has written its ready marker.
    async fn wait_ready(&self) -> Result<(), RestoreError> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Some(message) = self.failure() {
                return Err(RestoreError::Agent(message));
            }
            let pending: Vec<i32> = self
                .layout
                .segments
                .iter()
                .filter(|segment| !pipes::ready_marker_path(&segment.pipe_dir).exists())
                .map(|segment| segment.content_id)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RestoreError::Agent(format!(
                    "agents for segments {pending:?} not ready after {:?}",
                    self.startup_timeout
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn agent_command(&self, segment: &SegmentLayout, tables: &[TableId]) -> Command {
        let include = tables
            .iter()
            .map(TableId::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut cmd = Command::new(&self.streamer);
        cmd.arg("--restore")
            .arg("--agent")
            .arg(format!("--content={}", segment.content_id))
            .arg(format!("--toc={}", segment.toc_path.display()))
            .arg(format!("--data-file={}", segment.data_file.display()))
            .arg(format!("--pipe-dir={}", segment.pipe_dir.display()))
            .arg(format!("--include-table-ids={include}"))
            .args(&self.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }

    fn record_failure(failure_tx: &watch::Sender<Option<String>>, message: String) {
        tracing::error!(%message, "segment agent failed");
        failure_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(message);
            true
        });
    }

    fn failure(&self) -> Option<String> {
        self.failure_tx.borrow().clone()
    }
}

#[async_trait]
impl SegmentAgents for LocalAgentSupervisor {
    async fn verify_backup_file_count(
        &self,
        layout: DataLayout,
        expected: usize,
    ) -> Result<(), RestoreError> {
        let mut problems = Vec::new();
        for segment in &self.layout.segments {
            let found = match layout {
                DataLayout::SingleDataFile => [&segment.toc_path, &segment.data_file]
                    .into_iter()
                    .filter(|path| path.is_file())
                    .count(),
                DataLayout::FilePerTable => segment
                    .table_files
                    .iter()
                    .filter(|path| path.is_file())
                    .count(),
            };
            if found != expected {
                problems.push(format!(
                    "segment {} has {found} backup file(s), expected {expected}",
                    segment.content_id
                ));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(RestoreError::Preflight(problems.join("; ")))
        }
    }

    async fn start(&self, tables: &[TableId]) -> Result<Vec<TableId>, RestoreError> {
        let order = self.serve_order(tables)?;
        let mut state = self.state.lock().await;
        if state.shutdown.is_some() {
            return Err(RestoreError::Agent("agents already started".to_string()));
        }
        let shutdown = CancellationToken::new();
        state.shutdown = Some(shutdown.clone());
        state.tables = tables.to_vec();

        for segment in &self.layout.segments {
            pipes::create_table_pipes(&segment.pipe_dir, tables).map_err(|err| {
                RestoreError::Agent(format!(
                    "segment {}: create pipes in {}: {err}",
                    segment.content_id,
                    segment.pipe_dir.display()
                ))
            })?;
            pipes::clear_ready(&segment.pipe_dir).map_err(|err| {
                RestoreError::Agent(format!(
                    "segment {}: clear ready marker: {err}",
                    segment.content_id
                ))
            })?;

            let mut child = self.agent_command(segment, tables).spawn().map_err(|err| {
                RestoreError::Agent(format!(
                    "segment {}: spawn {}: {err}",
                    segment.content_id,
                    self.streamer.display()
                ))
            })?;
            tracing::debug!(content = segment.content_id, pid = ?child.id(), "agent started");

            let content = segment.content_id;
            let token = shutdown.clone();
            let failure_tx = self.failure_tx.clone();
            state.monitors.push(tokio::spawn(async move {
                tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) if status.success() => {
                            tracing::debug!(content, "agent exited");
                        }
                        Ok(status) => Self::record_failure(
                            &failure_tx,
                            format!("segment {content}: agent exited with {status}"),
                        ),
                        Err(err) => Self::record_failure(
                            &failure_tx,
                            format!("segment {content}: wait for agent: {err}"),
                        ),
                    },
                    _ = token.cancelled() => {
                        if let Err(err) = child.kill().await {
                            tracing::debug!(content, error = %err, "kill agent");
                        }
                    }
                }
            }));
        }
        drop(state);

        self.wait_ready().await?;
        for segment in &self.layout.segments {
            let missing: Vec<TableId> = tables
                .iter()
                .copied()
                .filter(|id| !pipes::is_fifo(&pipes::pipe_path(&segment.pipe_dir, *id)))
                .collect();
            if !missing.is_empty() {
                return Err(RestoreError::Agent(format!(
                    "segment {}: pipes missing for tables {missing:?}",
                    segment.content_id
                )));
            }
        }
        tracing::info!(
            segments = self.layout.segments.len(),
            tables = tables.len(),
            "segment agents ready"
        );
        Ok(order)
    }

    async fn skip_table(&self, table_id: TableId) -> Result<(), RestoreError> {
        for segment in &self.layout.segments {
            pipes::mark_skipped(&segment.pipe_dir, table_id).map_err(|err| {
                RestoreError::Agent(format!(
                    "segment {}: mark table {table_id} skipped: {err}",
                    segment.content_id
                ))
            })?;
        }
        Ok(())
    }

    async fn failed(&self) -> RestoreError {
        let mut rx = self.failure_tx.subscribe();
        loop {
            if let Some(message) = rx.borrow_and_update().clone() {
                return RestoreError::Agent(message);
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    async fn teardown(&self) -> Result<(), RestoreError> {
        let mut state = self.state.lock().await;
        if let Some(shutdown) = state.shutdown.take() {
            shutdown.cancel();
        }
        for monitor in state.monitors.drain(..) {
            if let Err(err) = monitor.await {
                tracing::warn!(error = %err, "agent monitor task failed");
            }
        }
        let tables = std::mem::take(&mut state.tables);
        for segment in &self.layout.segments {
            pipes::remove_table_pipes(&segment.pipe_dir, &tables);
            if let Err(err) = pipes::clear_ready(&segment.pipe_dir) {
                tracing::warn!(content = segment.content_id, error = %err, "remove ready marker");
            }
        }
        tracing::debug!("segment agents torn down");
        match self.failure() {
            Some(message) => Err(RestoreError::Agent(message)),
            None => Ok(()),
        }
    }
}
