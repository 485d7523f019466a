//! Worker-side telemetry sampler
//!
//! A dedicated thread outside the I/O path. Every `interval` it folds
//! whatever shadow book a swap handed over into its own `sum` book,
//! serializes `sum` and publishes the snapshot to the worker's shared
//! region. The snapshot is rewritten every tick even when no swap
//! happened, so `uptime`/`timestamp` stay fresh.

use kestrel_core::log_error;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{render_snapshot, Stats};
use crate::shm::SharedRegion;
use crate::signals;

/// Handle to one worker's sampler thread
pub struct Sampler {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Sampler {
    /// Start the sampler against this worker's stats and shared region.
    pub fn spawn(stats: Arc<Stats>, shm: Arc<SharedRegion>) -> Sampler {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("kestrel-sampler".into())
            .spawn(move || {
                // keep SIGALRM and the master set on the I/O thread
                signals::block_all_in_thread();
                sampler_loop(&stats, &shm, &shutdown_clone);
            })
            .expect("failed to spawn sampler thread");

        Sampler {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop and join the sampler.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sampler_loop(stats: &Stats, shm: &SharedRegion, shutdown: &AtomicBool) {
    let mut sum = stats.fresh_book();
    let interval = Duration::from_millis(stats.interval_ms);

    loop {
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(interval);

        stats.drain_shadow_into(&mut sum);

        let payload = render_snapshot(&sum, stats.source(), stats.start_ts());
        if let Err(e) = shm.write_snapshot(&payload) {
            log_error!("publish snapshot of {} bytes failed: {}", payload.len(), e);
        }
    }
}
