//! Background scan worker
//!
//! Runs [`DeviceRegistry::scan`] on a dedicated OS thread every scan interval,
//! optionally followed by a cache and status refresh. Shutdown is
//! cooperative: the stop flag is checked between iterations and the thread
//! is joined before the registry can be torn down.

use crate::error::Result;
use crate::registry::DeviceRegistry;
use common::UsbBackend;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Granularity of the stop-flag check while sleeping
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle to the running scan thread
#[derive(Debug)]
pub struct ScanWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ScanWorker {
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for its current iteration to finish
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Scan worker panicked");
            }
        }
    }
}

impl Drop for ScanWorker {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

/// Spawn the scan thread for `registry`
pub fn spawn_scan_worker<B>(registry: Arc<DeviceRegistry<B>>) -> Result<ScanWorker>
where
    B: UsbBackend + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let handle = std::thread::Builder::new()
        .name("odrive-scan".to_string())
        .spawn(move || run(&registry, &thread_stop))?;

    Ok(ScanWorker {
        stop,
        handle: Some(handle),
    })
}

fn run<B: UsbBackend>(registry: &DeviceRegistry<B>, stop: &AtomicBool) {
    let settings = registry.config().registry.clone();
    info!(
        "Scan worker started (interval {:?}, cache refresh {})",
        settings.scan_interval(),
        settings.refresh_cache
    );

    while !stop.load(Ordering::Acquire) {
        let started = Instant::now();

        match registry.scan() {
            Ok(report) if !report.is_empty() => debug!("Scan: {:?}", report),
            Ok(_) => {}
            Err(e) => error!("Device scan failed: {}", e),
        }

        if settings.refresh_cache && !stop.load(Ordering::Acquire) {
            let stored = registry.refresh_all_caches();
            registry.refresh_statuses();
            debug!("Refreshed {} cached values", stored);
        }

        let deadline = started + settings.scan_interval();
        while !stop.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
        }
    }

    info!("Scan worker stopped");
}
