use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cleanup::JobCleanup;
use crate::config::SchedulerConfig;
use crate::digest::JobDigest;
use crate::store::JobStore;

const MIN_INTERVAL: Duration = Duration::from_millis(10);
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Drives [`JobDigest`] cycles on a dedicated thread.
#[derive(Debug, Clone, Default)]
pub struct DigestScheduler {
    config: SchedulerConfig,
    cleanup: JobCleanup,
}

/// Handle for a running scheduler (trigger + shutdown).
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also stops
/// the thread, but does not wait for it.
#[derive(Debug)]
pub struct DigestSchedulerHandle {
    shutdown: mpsc::Sender<()>,
    trigger: mpsc::SyncSender<()>,
    cycles: Arc<AtomicU64>,
    join: Option<thread::JoinHandle<()>>,
}

impl DigestSchedulerHandle {
    /// Request a cycle as soon as possible.
    ///
    /// Triggers are coalesced: while one is pending, further calls are no-ops.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Digest cycles finished so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Stop the thread after the current cycle and wait for it.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl DigestScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            cleanup: JobCleanup::default(),
        }
    }

    pub fn with_cleanup(mut self, cleanup: JobCleanup) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Spawn the scheduler thread.
    ///
    /// - Schedule: one cycle on startup, then every `interval`
    /// - Trigger: `handle.trigger()` runs a cycle early
    /// - Cleanup: every `cleanup_every` cycles
    /// - Failures: logged; the loop keeps going
    pub fn spawn<S>(&self, digest: Arc<JobDigest<S>>) -> std::io::Result<DigestSchedulerHandle>
    where
        S: JobStore + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::sync_channel::<()>(1);
        let cycles = Arc::new(AtomicU64::new(0));

        let cfg = self.clone();
        let counter = cycles.clone();
        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || scheduler_loop(cfg, digest, shutdown_rx, trigger_rx, counter))?;

        Ok(DigestSchedulerHandle {
            shutdown: shutdown_tx,
            trigger: trigger_tx,
            cycles,
            join: Some(join),
        })
    }
}

fn scheduler_loop<S: JobStore>(
    cfg: DigestScheduler,
    digest: Arc<JobDigest<S>>,
    shutdown_rx: mpsc::Receiver<()>,
    trigger_rx: mpsc::Receiver<()>,
    cycles: Arc<AtomicU64>,
) {
    let name = cfg.config.name.as_str();
    let interval = cfg.config.interval.max(MIN_INTERVAL);
    info!(scheduler = name, interval_ms = interval.as_millis() as u64, "digest scheduler started");

    let mut next_tick = Instant::now() + interval;
    let mut pending = true; // run once on startup
    let mut since_cleanup: u32 = 0;

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let now = Instant::now();
        if now >= next_tick {
            pending = true;
            while next_tick <= now {
                next_tick += interval;
            }
        }

        while trigger_rx.try_recv().is_ok() {
            pending = true;
        }

        if !pending {
            let sleep_for = next_tick.saturating_duration_since(Instant::now()).min(IDLE_POLL);
            thread::sleep(sleep_for);
            continue;
        }
        pending = false;

        match digest.run() {
            Ok(report) => debug!(scheduler = name, report = ?report, "digest cycle done"),
            Err(e) => warn!(scheduler = name, error = %e, "digest cycle failed"),
        }
        cycles.fetch_add(1, Ordering::SeqCst);

        if cfg.config.cleanup_every > 0 {
            since_cleanup += 1;
            if since_cleanup >= cfg.config.cleanup_every {
                since_cleanup = 0;
                if let Err(e) = cfg.cleanup.run(digest.store(), digest.clock().now()) {
                    warn!(scheduler = name, error = %e, "job cleanup failed");
                }
            }
        }
    }

    info!(scheduler = name, "digest scheduler stopped");
}
