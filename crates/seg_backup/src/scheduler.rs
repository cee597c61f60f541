//! Coordinator-side restore scheduler.
//!
//! Drives a fixed, ordered list of table restore tasks over a pool of
//! database connections. In single-data-file mode the segment agents are
//! started before the first import and torn down after the last one.
//!
//! Tasks leave a single FIFO queue in extent order. Every table has its own
//! pipe, so a worker whose import reaches the engine early waits on that pipe
//! until the agent gets there; the earliest unfinished extent is always held
//! by an in-flight worker, which keeps the agents moving. A table whose import
//! fails is marked skipped at every agent so the agents stay in step with
//! their ledgers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{self, Either};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agents::SegmentAgents;
use crate::error::RestoreError;
use crate::extent::TableId;
use crate::progress::{ProgressSink, TableOutcome};
use crate::task::TableRestoreTask;

/// How table data is laid out in the backup being restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DataLayout {
    /// One data file per segment shared by all tables, served by agents.
    SingleDataFile,
    /// One independent data file per table per segment.
    FilePerTable,
}

/// Files each segment is expected to hold for a backup of `tables` tables.
pub fn expected_file_count(layout: DataLayout, tables: usize) -> usize {
    match layout {
        // The data file plus the segment ledger.
        DataLayout::SingleDataFile => 2,
        DataLayout::FilePerTable => tables,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Idle,
    AgentsStarting,
    Dispatching,
    Draining,
    Done,
}

/// One database session owned by a single worker.
#[async_trait]
pub trait RestoreConnection: Send {
    /// Apply per-connection session settings; called once before any import.
    async fn apply_session_settings(&mut self, statements: &[String]) -> Result<(), RestoreError>;

    /// Run the import command for one table and wait for it to finish.
    async fn import_table(
        &mut self,
        task: &TableRestoreTask,
        layout: DataLayout,
    ) -> Result<(), RestoreError>;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, worker: usize) -> Result<Box<dyn RestoreConnection>, RestoreError>;
}

/// Everything the scheduler needs to restore a filtered set of tables.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// Tasks in extent order.
    pub tasks: Vec<TableRestoreTask>,
    pub layout: DataLayout,
    pub jobs: usize,
    pub on_error_continue: bool,
    pub session_settings: Vec<String>,
    pub expected_file_count: usize,
}

impl RestorePlan {
    pub fn new(tasks: Vec<TableRestoreTask>, layout: DataLayout) -> Self {
        let expected_file_count = expected_file_count(layout, tasks.len());
        Self {
            tasks,
            layout,
            jobs: 1,
            on_error_continue: false,
            session_settings: Vec::new(),
            expected_file_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFailure {
    pub table_id: TableId,
    pub table: String,
    pub reason: String,
}

/// Outcome of a restore that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub total: usize,
    pub succeeded: usize,
    pub failures: Vec<TableFailure>,
    /// Workers that lost their connection and stopped early.
    pub worker_failures: Vec<String>,
}

impl RestoreReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.worker_failures.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Put `tasks` into the agents' serve `order` and rechain predecessors.
fn order_tasks(
    tasks: Vec<TableRestoreTask>,
    order: &[TableId],
) -> Result<Vec<TableRestoreTask>, RestoreError> {
    let requested: Vec<TableId> = tasks.iter().map(|task| task.table_id).collect();
    let mut by_id: HashMap<TableId, TableRestoreTask> = tasks
        .into_iter()
        .map(|task| (task.table_id, task))
        .collect();

    let mut ordered = Vec::with_capacity(order.len());
    let mut previous = None;
    for table_id in order {
        let mut task = by_id.remove(table_id).ok_or_else(|| {
            RestoreError::Agent(format!("agents serve table {table_id}, which is not planned"))
        })?;
        task.previous_table_id = previous;
        previous = Some(task.table_id);
        ordered.push(task);
    }
    if !by_id.is_empty() {
        let mut missing: Vec<TableId> = by_id.into_keys().collect();
        missing.sort_unstable();
        return Err(RestoreError::Agent(format!(
            "agents will not serve tables {missing:?}"
        )));
    }
    if requested.as_slice() != order {
        tracing::info!("restoring tables in backup order rather than requested order");
    }
    Ok(ordered)
}

/// State shared by the workers of one dispatch.
struct Dispatch {
    connections: Arc<dyn ConnectionFactory>,
    agents: Arc<dyn SegmentAgents>,
    progress: Arc<dyn ProgressSink>,
    queue: Mutex<mpsc::Receiver<TableRestoreTask>>,
    layout: DataLayout,
    on_error_continue: bool,
    session_settings: Vec<String>,
    total: usize,
    completed: AtomicUsize,
    report: std::sync::Mutex<RestoreReport>,
    cancel: CancellationToken,
}

impl Dispatch {
    async fn next_task(&self) -> Option<TableRestoreTask> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.queue.lock().await.recv().await
    }

    fn finish_table(&self, task: &TableRestoreTask, outcome: TableOutcome) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress
            .table_finished(completed, self.total, task, &outcome);
        if let Ok(mut report) = self.report.lock() {
            match outcome {
                TableOutcome::Restored => report.succeeded += 1,
                TableOutcome::Failed(reason) => report.failures.push(TableFailure {
                    table_id: task.table_id,
                    table: task.schema_qualified_name.clone(),
                    reason,
                }),
            }
        }
    }

    fn worker_failed(&self, worker: usize, err: &RestoreError) {
        tracing::warn!(worker, error = %err, "worker stopped");
        if let Ok(mut report) = self.report.lock() {
            report.worker_failures.push(err.to_string());
        }
    }

    /// Record a failed table and, for shared data files, release its extent.
    async fn fail_table(&self, task: &TableRestoreTask, reason: String) {
        if self.layout == DataLayout::SingleDataFile {
            if let Err(err) = self.agents.skip_table(task.table_id).await {
                tracing::warn!(table_id = task.table_id, error = %err, "skip table at agents");
            }
        }
        self.finish_table(task, TableOutcome::Failed(reason));
    }

    async fn run_worker(&self, worker: usize) -> Result<(), RestoreError> {
        let mut conn = match self.open_connection(worker).await {
            Ok(conn) => conn,
            Err(err) if self.on_error_continue => {
                self.worker_failed(worker, &err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        while let Some(task) = self.next_task().await {
            tracing::debug!(worker, table = %task.schema_qualified_name, "restoring table");
            let result = tokio::select! {
                res = conn.import_table(&task, self.layout) => res,
                _ = self.cancel.cancelled() => return Err(RestoreError::Cancelled),
            };
            match result {
                Ok(()) => self.finish_table(&task, TableOutcome::Restored),
                Err(err) => {
                    tracing::error!(
                        worker,
                        table = %task.schema_qualified_name,
                        error = %err,
                        "table restore failed"
                    );
                    self.fail_table(&task, err.to_string()).await;
                    if !self.on_error_continue {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    async fn open_connection(
        &self,
        worker: usize,
    ) -> Result<Box<dyn RestoreConnection>, RestoreError> {
        let mut conn = self.connections.connect(worker).await?;
        conn.apply_session_settings(&self.session_settings).await?;
        Ok(conn)
    }
}

/// Restore scheduler bound to its external collaborators.
pub struct RestoreScheduler {
    connections: Arc<dyn ConnectionFactory>,
    agents: Arc<dyn SegmentAgents>,
    progress: Arc<dyn ProgressSink>,
    phase: watch::Sender<RestorePhase>,
}

impl RestoreScheduler {
    pub fn new(
        connections: Arc<dyn ConnectionFactory>,
        agents: Arc<dyn SegmentAgents>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let (phase, _) = watch::channel(RestorePhase::Idle);
        Self {
            connections,
            agents,
            progress,
            phase,
        }
    }

    /// Phase of the current or most recent run.
    pub fn phase(&self) -> RestorePhase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: RestorePhase) {
        tracing::debug!(?phase, "restore phase");
        self.phase.send_replace(phase);
    }

    /// Restore every task in `plan`.
    ///
    /// Table failures under continue-on-error end up in the report; anything
    /// that stops the restore early is returned as an error after the agents
    /// have been torn down.
    pub async fn run(&self, mut plan: RestorePlan) -> Result<RestoreReport, RestoreError> {
        self.set_phase(RestorePhase::Idle);
        let total = plan.tasks.len();
        if total == 0 {
            self.set_phase(RestorePhase::Done);
            return Ok(RestoreReport::default());
        }

        self.agents
            .verify_backup_file_count(plan.layout, plan.expected_file_count)
            .await?;

        let single_file = plan.layout == DataLayout::SingleDataFile;
        if single_file {
            self.set_phase(RestorePhase::AgentsStarting);
            let tables: Vec<TableId> = plan.tasks.iter().map(|task| task.table_id).collect();
            let started = match self.agents.start(&tables).await {
                Ok(order) => order_tasks(std::mem::take(&mut plan.tasks), &order),
                Err(err) => Err(err),
            };
            match started {
                Ok(tasks) => plan.tasks = tasks,
                Err(err) => {
                    self.teardown_agents().await;
                    self.set_phase(RestorePhase::Done);
                    return Err(err);
                }
            }
        }

        tracing::info!(tables = total, jobs = plan.jobs, "restoring data");
        self.set_phase(RestorePhase::Dispatching);
        let mut result = self.dispatch(plan).await;

        if single_file {
            match self.agents.teardown().await {
                Err(err) if result.is_ok() => result = Err(err),
                Err(err) => tracing::warn!(error = %err, "agent teardown"),
                Ok(()) => {}
            }
        }
        self.set_phase(RestorePhase::Done);
        if let Ok(report) = &result {
            tracing::info!(
                succeeded = report.succeeded,
                failed = report.failures.len(),
                "data restore complete"
            );
        }
        result
    }

    async fn teardown_agents(&self) {
        if let Err(err) = self.agents.teardown().await {
            tracing::warn!(error = %err, "agent teardown");
        }
    }

    async fn dispatch(&self, plan: RestorePlan) -> Result<RestoreReport, RestoreError> {
        let total = plan.tasks.len();
        let (tx, rx) = mpsc::channel(total);
        for task in plan.tasks {
            tx.try_send(task)
                .map_err(|err| RestoreError::Worker {
                    worker: 0,
                    reason: format!("queue task: {err}"),
                })?;
        }
        drop(tx);

        let dispatch = Arc::new(Dispatch {
            connections: Arc::clone(&self.connections),
            agents: Arc::clone(&self.agents),
            progress: Arc::clone(&self.progress),
            queue: Mutex::new(rx),
            layout: plan.layout,
            on_error_continue: plan.on_error_continue,
            session_settings: plan.session_settings,
            total,
            completed: AtomicUsize::new(0),
            report: std::sync::Mutex::new(RestoreReport {
                total,
                ..RestoreReport::default()
            }),
            cancel: CancellationToken::new(),
        });

        let jobs = plan.jobs.clamp(1, total);
        let mut workers = FuturesUnordered::new();
        for worker in 0..jobs {
            let dispatch = Arc::clone(&dispatch);
            let handle = tokio::spawn(async move { dispatch.run_worker(worker).await });
            workers.push(async move { (worker, handle.await) });
        }

        let agent_failure = if plan.layout == DataLayout::SingleDataFile {
            Either::Left(self.agents.failed())
        } else {
            Either::Right(future::pending())
        };
        tokio::pin!(agent_failure);

        let mut fatal: Option<RestoreError> = None;
        let mut draining = false;
        loop {
            tokio::select! {
                joined = workers.next() => {
                    let Some((worker, joined)) = joined else { break };
                    if !draining {
                        draining = true;
                        self.set_phase(RestorePhase::Draining);
                    }
                    let err = match joined {
                        Ok(Ok(())) => continue,
                        Ok(Err(err)) => err,
                        Err(join_err) => RestoreError::Worker { worker, reason: join_err.to_string() },
                    };
                    if fatal.is_none() && !matches!(err, RestoreError::Cancelled) {
                        fatal = Some(err);
                    }
                    dispatch.cancel.cancel();
                }
                err = &mut agent_failure, if fatal.is_none() => {
                    fatal = Some(err);
                    dispatch.cancel.cancel();
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        // Every worker gave up on its connection before the queue emptied.
        while let Some(task) = dispatch.queue.lock().await.recv().await {
            dispatch
                .fail_table(&task, "no worker connection available".to_string())
                .await;
        }

        let report = match dispatch.report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::LogProgress;
    use crate::task::{build_tasks, DataEntry};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeAgents {
        started: std::sync::Mutex<Vec<TableId>>,
        skipped: std::sync::Mutex<Vec<TableId>>,
        torn_down: AtomicBool,
        fail_start: bool,
        fail_preflight: bool,
        /// Serve order reported by `start`; the requested order when unset.
        serve_order: Option<Vec<TableId>>,
        preflight_layout: std::sync::Mutex<Option<DataLayout>>,
    }

    #[async_trait]
    impl SegmentAgents for FakeAgents {
        async fn verify_backup_file_count(
            &self,
            layout: DataLayout,
            expected: usize,
        ) -> Result<(), RestoreError> {
            *self.preflight_layout.lock().unwrap() = Some(layout);
            if self.fail_preflight {
                return Err(RestoreError::Preflight(format!("expected {expected}")));
            }
            Ok(())
        }

        async fn start(&self, tables: &[TableId]) -> Result<Vec<TableId>, RestoreError> {
            if self.fail_start {
                return Err(RestoreError::Agent("no agent".to_string()));
            }
            self.started.lock().unwrap().extend_from_slice(tables);
            Ok(self.serve_order.clone().unwrap_or_else(|| tables.to_vec()))
        }

        async fn skip_table(&self, table_id: TableId) -> Result<(), RestoreError> {
            self.skipped.lock().unwrap().push(table_id);
            Ok(())
        }

        async fn teardown(&self) -> Result<(), RestoreError> {
            self.torn_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDb {
        imported: std::sync::Mutex<Vec<(usize, TableId)>>,
        settings_applied: AtomicUsize,
        failing_tables: Vec<TableId>,
        failing_workers: Vec<usize>,
    }

    struct FakeConn {
        worker: usize,
        db: Arc<FakeDb>,
    }

    #[async_trait]
    impl RestoreConnection for FakeConn {
        async fn apply_session_settings(
            &mut self,
            statements: &[String],
        ) -> Result<(), RestoreError> {
            assert_eq!(statements, &["SET client_encoding = 'UTF8'".to_string()]);
            self.db.settings_applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn import_table(
            &mut self,
            task: &TableRestoreTask,
            _layout: DataLayout,
        ) -> Result<(), RestoreError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if self.db.failing_tables.contains(&task.table_id) {
                return Err(RestoreError::Import {
                    table: task.schema_qualified_name.clone(),
                    reason: "relation does not exist".to_string(),
                });
            }
            self.db
                .imported
                .lock()
                .unwrap()
                .push((self.worker, task.table_id));
            Ok(())
        }
    }

    #[async_trait]
    impl ConnectionFactory for Arc<FakeDb> {
        async fn connect(&self, worker: usize) -> Result<Box<dyn RestoreConnection>, RestoreError> {
            if self.failing_workers.contains(&worker) {
                return Err(RestoreError::ConnectionFailure {
                    worker,
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(FakeConn {
                worker,
                db: Arc::clone(self),
            }))
        }
    }

    fn plan(count: u32, layout: DataLayout, jobs: usize) -> RestorePlan {
        let entries: Vec<DataEntry> = (1..=count)
            .map(|id| DataEntry::new(id, "public", format!("t{id}")))
            .collect();
        let mut plan = RestorePlan::new(build_tasks(&entries), layout);
        plan.jobs = jobs;
        plan.session_settings = vec!["SET client_encoding = 'UTF8'".to_string()];
        plan
    }

    fn scheduler(db: &Arc<FakeDb>, agents: &Arc<FakeAgents>) -> RestoreScheduler {
        RestoreScheduler::new(
            Arc::new(Arc::clone(db)),
            Arc::clone(agents) as Arc<dyn SegmentAgents>,
            Arc::new(LogProgress),
        )
    }

    #[test]
    fn expected_files_by_layout() {
        assert_eq!(expected_file_count(DataLayout::SingleDataFile, 40), 2);
        assert_eq!(expected_file_count(DataLayout::FilePerTable, 40), 40);
    }

    #[tokio::test]
    async fn serial_restore_imports_in_order() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents::default());
        let sched = scheduler(&db, &agents);

        let report = sched
            .run(plan(5, DataLayout::SingleDataFile, 1))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.exit_code(), 0);
        let order: Vec<TableId> = db.imported.lock().unwrap().iter().map(|(_, t)| *t).collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
        assert_eq!(*agents.started.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert!(agents.torn_down.load(Ordering::SeqCst));
        assert_eq!(sched.phase(), RestorePhase::Done);
    }

    #[tokio::test]
    async fn parallel_workers_each_apply_settings_once() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents::default());
        let report = scheduler(&db, &agents)
            .run(plan(20, DataLayout::FilePerTable, 4))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 20);
        assert_eq!(db.settings_applied.load(Ordering::SeqCst), 4);
        assert_eq!(db.imported.lock().unwrap().len(), 20);
        // Independent files need no agents.
        assert!(agents.started.lock().unwrap().is_empty());
        assert!(!agents.torn_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn more_jobs_than_tables_is_clamped() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents::default());
        scheduler(&db, &agents)
            .run(plan(2, DataLayout::SingleDataFile, 8))
            .await
            .unwrap();
        assert_eq!(db.settings_applied.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn continue_on_error_records_failure_and_skips_extent() {
        let db = Arc::new(FakeDb {
            failing_tables: vec![3],
            ..FakeDb::default()
        });
        let agents = Arc::new(FakeAgents::default());
        let mut plan = plan(5, DataLayout::SingleDataFile, 2);
        plan.on_error_continue = true;

        let report = scheduler(&db, &agents).run(plan).await.unwrap();
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].table, "public.t3");
        assert_eq!(report.exit_code(), 1);
        assert_eq!(*agents.skipped.lock().unwrap(), vec![3]);
        assert!(agents.torn_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failure_without_continue_aborts_and_tears_down() {
        let db = Arc::new(FakeDb {
            failing_tables: vec![2],
            ..FakeDb::default()
        });
        let agents = Arc::new(FakeAgents::default());
        let err = scheduler(&db, &agents)
            .run(plan(10, DataLayout::SingleDataFile, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Import { .. }));
        assert!(agents.torn_down.load(Ordering::SeqCst));
        // Nothing after the failed table was attempted.
        let order: Vec<TableId> = db.imported.lock().unwrap().iter().map(|(_, t)| *t).collect();
        assert_eq!(order, vec![1]);
    }

    #[tokio::test]
    async fn lost_connection_is_fatal_unless_continuing() {
        let db = Arc::new(FakeDb {
            failing_workers: vec![1],
            ..FakeDb::default()
        });
        let agents = Arc::new(FakeAgents::default());
        let err = scheduler(&db, &agents)
            .run(plan(6, DataLayout::FilePerTable, 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RestoreError::ConnectionFailure { worker: 1, .. }
        ));

        let mut continuing = plan(6, DataLayout::FilePerTable, 2);
        continuing.on_error_continue = true;
        let report = scheduler(&db, &agents).run(continuing).await.unwrap();
        assert_eq!(report.worker_failures.len(), 1);
        assert_eq!(report.succeeded, 6);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn tables_left_without_workers_are_failed() {
        let db = Arc::new(FakeDb {
            failing_workers: vec![0, 1],
            ..FakeDb::default()
        });
        let agents = Arc::new(FakeAgents::default());
        let mut plan = plan(3, DataLayout::SingleDataFile, 2);
        plan.on_error_continue = true;
        let report = scheduler(&db, &agents).run(plan).await.unwrap();
        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failures.len(), 3);
        assert_eq!(*agents.skipped.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn agent_start_failure_surfaces_after_teardown() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents {
            fail_start: true,
            ..FakeAgents::default()
        });
        let err = scheduler(&db, &agents)
            .run(plan(3, DataLayout::SingleDataFile, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Agent(_)));
        assert!(agents.torn_down.load(Ordering::SeqCst));
        assert!(db.imported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preflight_failure_stops_before_agents() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents {
            fail_preflight: true,
            ..FakeAgents::default()
        });
        let err = scheduler(&db, &agents)
            .run(plan(3, DataLayout::SingleDataFile, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Preflight(_)));
        assert!(agents.started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn imports_follow_agent_serve_order() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents {
            serve_order: Some(vec![3, 1, 2]),
            ..FakeAgents::default()
        });
        let report = scheduler(&db, &agents)
            .run(plan(3, DataLayout::SingleDataFile, 1))
            .await
            .unwrap();
        assert_eq!(report.succeeded, 3);
        let order: Vec<TableId> = db.imported.lock().unwrap().iter().map(|(_, t)| *t).collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[test]
    fn reordered_tasks_are_rechained() {
        let entries: Vec<DataEntry> = (1..=3)
            .map(|id| DataEntry::new(id, "public", format!("t{id}")))
            .collect();
        let tasks = order_tasks(build_tasks(&entries), &[2, 3, 1]).unwrap();
        let chain: Vec<(TableId, Option<TableId>)> = tasks
            .iter()
            .map(|task| (task.table_id, task.previous_table_id))
            .collect();
        assert_eq!(chain, vec![(2, None), (3, Some(2)), (1, Some(3))]);

        let err = order_tasks(build_tasks(&entries), &[1, 2]).unwrap_err();
        assert!(err.to_string().contains("[3]"), "{err}");
    }

    #[tokio::test]
    async fn mismatched_serve_order_aborts_before_dispatch() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents {
            serve_order: Some(vec![1, 9]),
            ..FakeAgents::default()
        });
        let err = scheduler(&db, &agents)
            .run(plan(2, DataLayout::SingleDataFile, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Agent(_)));
        assert!(agents.torn_down.load(Ordering::SeqCst));
        assert!(db.imported.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn preflight_sees_the_plan_layout() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents::default());
        scheduler(&db, &agents)
            .run(plan(4, DataLayout::FilePerTable, 2))
            .await
            .unwrap();
        assert_eq!(
            *agents.preflight_layout.lock().unwrap(),
            Some(DataLayout::FilePerTable)
        );
    }

    #[tokio::test]
    async fn empty_plan_is_done_immediately() {
        let db = Arc::new(FakeDb::default());
        let agents = Arc::new(FakeAgents::default());
        let sched = scheduler(&db, &agents);
        let report = sched
            .run(RestorePlan::new(Vec::new(), DataLayout::SingleDataFile))
            .await
            .unwrap();
        assert_eq!(report, RestoreReport::default());
        assert_eq!(sched.phase(), RestorePhase::Done);
    }
}
