//! Orchestrator for distributed runs
//!
//! One run walks `Init -> Dispatching -> Draining -> Done`:
//! - **Init**: orphaned tasks from a crashed run go back to idle
//! - **Dispatching**: claim idle tasks onto the task channel and commit whatever
//!   results came back, in the same loop, until no supply and no in-flight task is left
//!   (a slow worker fleet is waited for, with a warning once results stop for the grace period)
//! - **Draining**: keep committing late results until none arrive for the grace period
//! - **Done**: terminal; a new run starts over at `Init`
//!
//! The task channel never holds more than one dispatch batch, so a slow worker
//! fleet does not make it grow without bound.

use crate::config::QueueConfig;
use crate::model::TaskStatus;
use crate::queue::WorkQueue;
use crate::storage::{commit_results, CommitReport, Storage, TaskStore};
use crate::Result;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Results pulled off the result channel per commit
const RESULT_BATCH: usize = 256;

/// Orchestrator run phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Dispatching,
    Draining,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Dispatching => "dispatching",
            Phase::Draining => "draining",
            Phase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Dispatch sizing and timing
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    pub dispatch_batch: usize,
    pub dispatch_interval: Duration,
    pub drain_grace: Duration,
}

impl From<&QueueConfig> for OrchestratorOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            dispatch_batch: config.dispatch_batch.max(1),
            dispatch_interval: config.dispatch_interval(),
            drain_grace: config.drain_grace(),
        }
    }
}

/// Summary of one orchestrator run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorReport {
    pub orphans_reset: u64,
    pub dispatched: usize,
    pub results: usize,
    pub committed: CommitReport,
    pub exhausted: bool,
    pub cancelled: bool,

    /// Dispatched tasks with no result when the run was cancelled; the next run's orphan sweep re-queues them
    pub unresolved: Vec<i64>,
}

/// Hands tasks to workers and commits what they send back
pub struct Orchestrator {
    storage: Arc<dyn Storage>,
    queue: WorkQueue,
    options: OrchestratorOptions,
    phase: watch::Sender<Phase>,
    in_flight: HashSet<i64>,
    last_result: Instant,
    stall_reported: bool,
    report: OrchestratorReport,
}

impl Orchestrator {
    pub fn new(storage: Arc<dyn Storage>, queue: WorkQueue, options: OrchestratorOptions) -> Self {
        let (phase, _) = watch::channel(Phase::Init);
        Self {
            storage,
            queue,
            options,
            phase,
            in_flight: HashSet::new(),
            last_result: Instant::now(),
            stall_reported: false,
            report: OrchestratorReport::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver that observes every phase change
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: Phase) {
        tracing::info!("Orchestrator phase: {}", phase);
        self.phase.send_replace(phase);
    }

    /// Runs one crawl from `Init` to `Done`
    ///
    /// # Arguments
    ///
    /// * `cancel` - Ends the run early; in-flight tasks stay in progress for the next orphan sweep
    ///
    /// # Returns
    ///
    /// * `Ok(OrchestratorReport)` - The run reached `Done`
    /// * `Err(HarvestError)` - The store or the queue failed; the run is abandoned
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<OrchestratorReport> {
        self.report = OrchestratorReport::default();
        self.in_flight.clear();

        self.enter(Phase::Init);
        self.report.orphans_reset = self.storage.reset_orphaned_tasks().await?;
        if self.report.orphans_reset > 0 {
            tracing::warn!("Reset {} orphaned tasks", self.report.orphans_reset);
        }

        self.enter(Phase::Dispatching);
        self.last_result = Instant::now();
        self.stall_reported = false;
        loop {
            if !self.report.exhausted {
                self.dispatch().await?;
            }
            self.collect().await?;

            let supply_left = !self.report.exhausted
                && self.storage.count_tasks(TaskStatus::Idle).await? > 0;
            if !supply_left && self.in_flight.is_empty() {
                break;
            }
            if !self.in_flight.is_empty()
                && !self.stall_reported
                && self.last_result.elapsed() >= self.options.drain_grace
            {
                tracing::warn!(
                    "No results for {:?} with {} tasks in flight, still waiting",
                    self.options.drain_grace,
                    self.in_flight.len()
                );
                self.stall_reported = true;
            }

            if self.pause(cancel, self.options.dispatch_interval).await {
                return Ok(self.finish(true));
            }
        }

        self.enter(Phase::Draining);
        let mut quiet_since = Instant::now();
        while quiet_since.elapsed() < self.options.drain_grace {
            if self.collect().await? > 0 {
                quiet_since = Instant::now();
            }

            let nap = self
                .options
                .dispatch_interval
                .min(self.options.drain_grace.saturating_sub(quiet_since.elapsed()));
            if self.pause(cancel, nap).await {
                return Ok(self.finish(true));
            }
        }

        Ok(self.finish(false))
    }

    /// Sleeps for `nap`; true when `cancel` fired first
    async fn pause(&self, cancel: &CancellationToken, nap: Duration) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(nap) => false,
        }
    }

    fn finish(&mut self, cancelled: bool) -> OrchestratorReport {
        if cancelled {
            tracing::info!("Orchestrator cancelled");
        }

        let mut unresolved: Vec<i64> = self.in_flight.iter().copied().collect();
        unresolved.sort_unstable();
        if !unresolved.is_empty() {
            tracing::warn!("{} dispatched tasks never reported back", unresolved.len());
        }

        self.report.cancelled = cancelled;
        self.report.unresolved = unresolved;
        self.enter(Phase::Done);

        tracing::info!(
            "Run finished: {} tasks dispatched, {} results, {} records inserted, {} duplicates",
            self.report.dispatched,
            self.report.results,
            self.report.committed.records.inserted,
            self.report.committed.records.duplicates
        );
        self.report.clone()
    }

    /// Claims enough idle tasks to top the task channel up to one batch
    async fn dispatch(&mut self) -> Result<usize> {
        let backlog = self.queue.pending_tasks().await?;
        let room = self.options.dispatch_batch.saturating_sub(backlog);
        if room == 0 {
            return Ok(0);
        }

        let tasks = self.storage.claim_idle_tasks(room).await?;
        for task in &tasks {
            self.queue.push_task(task).await?;
            self.in_flight.insert(task.id);
        }

        if !tasks.is_empty() {
            tracing::info!("Dispatched {} tasks ({} in flight)", tasks.len(), self.in_flight.len());
        }
        self.report.dispatched += tasks.len();
        Ok(tasks.len())
    }

    /// Commits every result waiting on the result channel
    async fn collect(&mut self) -> Result<usize> {
        let mut collected = 0;
        loop {
            let results = self.queue.drain_results(RESULT_BATCH).await?;
            if results.is_empty() {
                return Ok(collected);
            }

            self.last_result = Instant::now();
            self.stall_reported = false;
            collected += results.len();
            self.report.results += results.len();

            for result in &results {
                self.in_flight.remove(&result.task_id);
                if result.listings_exhausted && !self.report.exhausted {
                    tracing::info!(
                        "Page {} reported the end of the listings, dispatch stops",
                        result.page_number
                    );
                    self.report.exhausted = true;
                }
            }

            let committed = commit_results(self.storage.as_ref(), results).await?;
            self.report.committed.records.merge(committed.records);
            self.report.committed.completed += committed.completed;
            self.report.committed.unknown_tasks += committed.unknown_tasks;
        }
    }
}
