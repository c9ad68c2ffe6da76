//! Bounded worker pool with a draining results buffer
//!
//! The pool runs at most `max_concurrency` units at once. Units are either
//! cooperative (`submit`, a tokio task) or blocking (`submit_blocking`, a
//! thread from tokio's blocking pool); both count against the same bound.
//! Every unit may contribute one output to a shared buffer, which a
//! background loop swaps out on a fixed interval and hands to a `Drain`.
//!
//! Shutdown stops new submissions, waits for every live unit, then stops the
//! drain loop after one final drain, so nothing produced before shutdown is lost.
//! A drain failure is fatal: the pool stops accepting work and `shutdown`
//! returns the error.

use crate::{HarvestError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Destination for drained outputs
#[async_trait]
pub trait Drain<T: Send + 'static>: Send + Sync {
    /// Takes ownership of one swapped-out batch; an error stops the pool
    async fn drain(&self, batch: Vec<T>) -> Result<()>;
}

/// Pool sizing and timing
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_concurrency: usize,

    /// How long a saturated `submit` sleeps before re-checking for a free slot
    pub submit_poll: Duration,

    pub drain_interval: Duration,
}

/// Totals reported by `shutdown`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub batches: usize,
    pub items: usize,
}

type Buffer<T> = Arc<Mutex<Vec<T>>>;

fn push_output<T>(buffer: &Buffer<T>, output: T) {
    buffer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(output);
}

/// Bounded pool of page-processing units
pub struct WorkerPool<T: Send + 'static> {
    options: PoolOptions,
    live: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    buffer: Buffer<T>,
    busy: Arc<AtomicBool>,
    stop: CancellationToken,
    halt: CancellationToken,
    drain_handle: JoinHandle<Result<DrainStats>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates the pool and starts its drain loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(options: PoolOptions, drain: Arc<dyn Drain<T>>) -> Self {
        let buffer: Buffer<T> = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let stop = CancellationToken::new();
        let halt = CancellationToken::new();

        let drain_handle = tokio::spawn(drain_loop(
            Arc::clone(&buffer),
            Arc::clone(&busy),
            drain,
            options.drain_interval,
            stop.clone(),
            halt.clone(),
        ));

        Self {
            options: PoolOptions {
                max_concurrency: options.max_concurrency.max(1),
                ..options
            },
            live: Mutex::new(Vec::new()),
            accepting: AtomicBool::new(true),
            buffer,
            busy,
            stop,
            halt,
            drain_handle,
        }
    }

    /// Starts a cooperative unit, waiting for a free slot first
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The unit is running
    /// * `Err(HarvestError::PoolClosed)` - The pool was closed or its drain failed
    pub async fn submit<F>(&self, unit: F) -> Result<()>
    where
        F: Future<Output = Option<T>> + Send + 'static,
    {
        loop {
            {
                let mut live = self.lock_live();
                if !self.is_accepting() {
                    return Err(HarvestError::PoolClosed);
                }
                if self.reap(&mut live) < self.options.max_concurrency {
                    let buffer = Arc::clone(&self.buffer);
                    live.push(tokio::spawn(async move {
                        if let Some(output) = unit.await {
                            push_output(&buffer, output);
                        }
                    }));
                    return Ok(());
                }
            }

            tokio::time::sleep(self.options.submit_poll).await;
        }
    }

    /// Starts a blocking unit on its own thread, waiting for a free slot first
    pub async fn submit_blocking<F>(&self, unit: F) -> Result<()>
    where
        F: FnOnce() -> Option<T> + Send + 'static,
    {
        loop {
            {
                let mut live = self.lock_live();
                if !self.is_accepting() {
                    return Err(HarvestError::PoolClosed);
                }
                if self.reap(&mut live) < self.options.max_concurrency {
                    let buffer = Arc::clone(&self.buffer);
                    live.push(tokio::task::spawn_blocking(move || {
                        if let Some(output) = unit() {
                            push_output(&buffer, output);
                        }
                    }));
                    return Ok(());
                }
            }

            tokio::time::sleep(self.options.submit_poll).await;
        }
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops finished units from the live set and returns how many remain
    fn reap(&self, live: &mut Vec<JoinHandle<()>>) -> usize {
        live.retain(|handle| !handle.is_finished());
        live.len()
    }

    /// Number of units still running
    pub fn live_units(&self) -> usize {
        let mut live = self.lock_live();
        self.reap(&mut live)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && !self.halt.is_cancelled()
    }

    /// True while a drained batch is being handed to the drain
    pub fn is_draining(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// True once the drain has failed; the pool accepts nothing after that
    pub fn has_failed(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// Stops accepting submissions; units already running continue
    pub fn close(&self) {
        let _live = self.lock_live();
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Closes the pool, waits for every live unit, then runs a final drain
    ///
    /// # Returns
    ///
    /// * `Ok(DrainStats)` - Everything produced was drained
    /// * `Err(HarvestError)` - The drain failed at some point during the pool's life
    pub async fn shutdown(self) -> Result<DrainStats> {
        let handles = {
            let mut live = self.lock_live();
            self.accepting.store(false, Ordering::SeqCst);
            std::mem::take(&mut *live)
        };

        tracing::debug!("Waiting for {} live units", handles.len());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Processing unit failed: {}", e);
            }
        }

        self.stop.cancel();
        let stats = self.drain_handle.await??;

        tracing::debug!(
            "Pool drained {} items in {} batches",
            stats.items,
            stats.batches
        );
        Ok(stats)
    }
}

async fn drain_loop<T: Send + 'static>(
    buffer: Buffer<T>,
    busy: Arc<AtomicBool>,
    drain: Arc<dyn Drain<T>>,
    interval: Duration,
    stop: CancellationToken,
    halt: CancellationToken,
) -> Result<DrainStats> {
    let mut stats = DrainStats::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let stopping = tokio::select! {
            _ = stop.cancelled() => true,
            _ = ticker.tick() => false,
        };

        let batch = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
        if !batch.is_empty() {
            let items = batch.len();
            busy.store(true, Ordering::SeqCst);
            let outcome = drain.drain(batch).await;
            busy.store(false, Ordering::SeqCst);

            if let Err(e) = outcome {
                tracing::error!("Draining results failed, stopping pool: {}", e);
                halt.cancel();
                return Err(e);
            }
            stats.batches += 1;
            stats.items += items;
        }

        if stopping {
            return Ok(stats);
        }
    }
}
