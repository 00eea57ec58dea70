//! Watchdog loop
//!
//! A dedicated background thread polls the snapshot engine on a fixed
//! interval. One all-idle round means little: a thread legitimately waits
//! on a mutex for a few milliseconds all the time. Only a fingerprint that
//! stays frozen across the whole confirmation window is treated as a
//! deadlock, at which point the loop reports and exits.

use crate::core::detector::{Detector, Inner};
use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

impl Detector {
    /// Start the background monitor thread
    ///
    /// # Errors
    /// Fails if the monitor is already running or the thread cannot be
    /// spawned.
    pub fn run(&self) -> Result<()> {
        let inner = self.inner();
        if inner.running.swap(true, Ordering::SeqCst) {
            bail!("monitor is already running");
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let loop_inner = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name("hangwatch-monitor".into())
            .spawn(move || monitor_loop(&loop_inner, &stop_rx))
            .context("failed to spawn the monitor thread");
        match spawned {
            Ok(handle) => {
                *inner.stop_tx.lock() = Some(stop_tx);
                *inner.monitor.lock() = Some(handle);
                Ok(())
            }
            Err(error) => {
                inner.running.store(false, Ordering::SeqCst);
                Err(error)
            }
        }
    }

    /// Request graceful shutdown; returns immediately
    ///
    /// The loop finishes any in-progress round (all suspended threads are
    /// resumed) before it observes the signal. Idempotent.
    pub fn stop(&self) {
        if let Some(stop_tx) = self.inner().stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
    }

    /// Block until the monitor thread has fully exited
    pub fn wait_until_stopped(&self) {
        let handle = self.inner().monitor.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn monitor_loop(inner: &Arc<Inner>, stop_rx: &Receiver<()>) {
    log::info!("monitoring started");
    let confirm_rounds = inner.config.confirm_rounds.max(1);
    let mut watchdog = confirm_rounds;
    loop {
        let outcome = {
            let mut registry = inner.registry.lock();
            inner.snapshot_locked(&mut registry, false)
        };
        if outcome.deadlock_candidate {
            watchdog -= 1;
            if watchdog == 0 {
                log::error!(
                    "deadlock detected: every monitored thread idle for {confirm_rounds} consecutive rounds"
                );
                let info = {
                    let registry = inner.registry.lock();
                    inner.deadlock_info(&registry)
                };
                (inner.callback)(info);
                if let Err(error) = inner.dump() {
                    log::error!("failed to write the hang report: {error:#}");
                }
                break;
            }
        } else {
            watchdog = confirm_rounds;
        }
        match stop_rx.recv_timeout(inner.config.tick) {
            Err(RecvTimeoutError::Timeout) => {}
            // Stop requested (or every handle dropped its sender)
            _ => break,
        }
    }
    inner.running.store(false, Ordering::SeqCst);
    log::info!("monitoring stopped");
}
