//! Background maintenance thread.
//!
//! Paces itself on allocation pressure: while most of the last turn's reclaim
//! candidates are still queued it slows down and prepares fewer pages; once
//! the queue drains it prepares more and runs a turn right away.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::store::CacheInner;
use crate::types::Result;
use crate::util::RateLimiter;

const THREAD_NAME: &str = "page-cache-housekeeper";

/// At most this many turn errors are logged per period
const ERROR_LOG_PERMITS: u32 = 5;
const ERROR_LOG_PERIOD: Duration = Duration::from_secs(10);

/// Pause while clients are still consuming the last turn's candidates
const CONSUMING_PAUSE: Duration = Duration::from_micros(50);

/// Turns skipped in a row before one is forced, so tokens keep decaying
const MAX_SKIPPED_STEPS: u32 = 100;

/// Handle to the running housekeeper thread
///
/// The thread only holds a weak reference to the cache and exits on its own
/// once the cache is gone; [`stop`](Self::stop) ends it deterministically.
pub(crate) struct Housekeeper {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Housekeeper {
    pub fn start(cache: &Arc<CacheInner>) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = bounded(1);
        let weak = Arc::downgrade(cache);
        cache.housekeeper_running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || run(weak, shutdown_rx));
        match spawned {
            Ok(handle) => {
                info!(
                    interval_us = cache.config.maintenance_interval.as_micros() as u64,
                    "page_cache.housekeeper.started"
                );
                Ok(Self {
                    shutdown_tx,
                    handle: Some(handle),
                })
            }
            Err(e) => {
                cache.housekeeper_running.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    /// Signal the thread and wait for it to finish its current turn
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.shutdown_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("page_cache.housekeeper.panicked");
            }
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(cache: Weak<CacheInner>, shutdown_rx: Receiver<()>) {
    let mut error_log = RateLimiter::new(ERROR_LOG_PERMITS, ERROR_LOG_PERIOD);
    let mut skipped_steps = 0;

    loop {
        // never hold the cache across a sleep, so dropping it is not delayed
        let sleep = {
            let Some(cache) = cache.upgrade() else {
                break;
            };
            if cache.is_closed() {
                cache.housekeeper_running.store(false, Ordering::Release);
                break;
            }
            step(&cache, &mut skipped_steps, &mut error_log)
        };

        match shutdown_rx.recv_timeout(sleep) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Some(cache) = cache.upgrade() {
        cache.housekeeper_running.store(false, Ordering::Release);
        // wake pending closers: their commands will never be served
        cache.fail_pending_commands();
    }
    info!("page_cache.housekeeper.stopped");
}

/// One pacing decision, possibly running a turn; returns how long to sleep
fn step(cache: &CacheInner, skipped_steps: &mut u32, error_log: &mut RateLimiter) -> Duration {
    let interval = cache.config.maintenance_interval;
    let remaining = cache.pages_remaining_to_reclaim();
    let prepared = cache.pages_prepared_to_reclaim();
    let must_run = cache.has_pending_commands() || *skipped_steps >= MAX_SKIPPED_STEPS;

    if remaining > prepared / 2 {
        // little allocation pressure: prepare fewer pages next time
        cache.adjust_percent_to_reclaim(false);
        if !must_run {
            *skipped_steps += 1;
            cache.statistics.record_maintenance_turn(true);
            return interval;
        }
    } else if remaining > 0 {
        if !must_run {
            *skipped_steps += 1;
            return CONSUMING_PAUSE;
        }
    } else {
        cache.adjust_percent_to_reclaim(true);
    }

    *skipped_steps = 0;

    if let Err(e) = cache.do_maintenance_turn() {
        if error_log.try_acquire() {
            let suppressed = error_log.take_suppressed();
            error!(error = %e, suppressed, "page_cache.housekeeper.turn_failed");
        }
    }
    interval
}
