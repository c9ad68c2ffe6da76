//! Orchestrator and workers in one process over an in-memory broker

use crate::config::Config;
use crate::crawler::orchestrator::{Orchestrator, OrchestratorOptions, OrchestratorReport};
use crate::crawler::processor::PageProcessor;
use crate::crawler::worker::{run_worker, WorkerOptions, WorkerReport};
use crate::queue::{MemoryBroker, WorkQueue};
use crate::storage::Storage;
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Runs a distributed crawl with `workers` in-process workers
///
/// Workers run until the orchestrator reaches `Done`, then finish whatever
/// they hold; results they publish after that are lost with the broker and
/// their tasks are re-queued by the next run's orphan sweep.
pub async fn run_local(
    storage: Arc<dyn Storage>,
    processor: PageProcessor,
    config: &Config,
    workers: usize,
    cancel: CancellationToken,
) -> Result<(OrchestratorReport, Vec<WorkerReport>)> {
    let queue = WorkQueue::new(Arc::new(MemoryBroker::new()), &config.queue);
    let worker_cancel = cancel.child_token();
    let options = WorkerOptions {
        idle_exit: None,
        ..WorkerOptions::from_config(config)
    };

    let handles: Vec<_> = (0..workers.max(1))
        .map(|_| {
            tokio::spawn(run_worker(
                queue.clone(),
                processor.clone(),
                options,
                worker_cancel.clone(),
            ))
        })
        .collect();
    tracing::info!("Started {} local workers", handles.len());

    let mut orchestrator = Orchestrator::new(
        storage,
        queue,
        OrchestratorOptions::from(&config.queue),
    );
    let outcome = orchestrator.run(&cancel).await;
    worker_cancel.cancel();

    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        reports.push(handle.await??);
    }

    Ok((outcome?, reports))
}
