//! Detection engine
//!
//! The engine owns the thread registry and performs snapshot rounds:
//! suspend every registered thread, capture and classify each stack, then
//! resume everything. The [`watchdog`] module drives rounds on a timer and
//! escalates sustained all-idle rounds to a declared deadlock; [`report`]
//! renders and writes the symbolized report.

pub mod report;
pub mod watchdog;

use crate::core::registry::{Classification, ThreadRegistry};
use crate::core::suspend::{StackSampler, SuspendError, Suspended};
use crate::core::symbolize::SymbolResolver;
use crate::core::types::{DeadlockInfo, ThreadId, ThreadStatus};
use crate::core::unwind::MAX_UNWIND_DEPTH;
use chrono::Utc;
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::Duration;

/// Tunables resolved by the `Hangwatch` builder
pub(crate) struct DetectorConfig {
    /// Polling interval of the watchdog loop
    pub tick: Duration,
    /// Consecutive all-idle rounds required before declaring a deadlock
    pub confirm_rounds: u32,
    /// Report sink; `None` writes to stderr
    pub report_path: Option<PathBuf>,
}

/// Aggregate result of one polling round
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundOutcome {
    /// Threads successfully suspended this round
    pub suspended: usize,
    /// Threads whose fingerprint was unchanged and non-zero
    pub idle: usize,
    /// Threads whose fingerprint changed
    pub active: usize,
    /// Threads whose stack could not be captured
    pub unreadable: usize,
    /// True when this round counts as evidence of a deadlock
    pub deadlock_candidate: bool,
}

pub(crate) struct Inner {
    pub(crate) registry: Mutex<ThreadRegistry>,
    pub(crate) sampler: Box<dyn StackSampler>,
    pub(crate) resolver: Mutex<Box<dyn SymbolResolver>>,
    pub(crate) callback: Box<dyn Fn(DeadlockInfo) + Send + Sync>,
    pub(crate) config: DetectorConfig,
    pub(crate) running: AtomicBool,
    pub(crate) stop_tx: Mutex<Option<Sender<()>>>,
    pub(crate) monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running (or stoppable) deadlock detector
///
/// Cheap to clone; all clones share the same engine. Constructed through
/// [`crate::Hangwatch`].
#[derive(Clone)]
pub struct Detector {
    inner: Arc<Inner>,
}

impl Detector {
    pub(crate) fn from_parts(
        config: DetectorConfig,
        sampler: Box<dyn StackSampler>,
        resolver: Box<dyn SymbolResolver>,
        callback: Box<dyn Fn(DeadlockInfo) + Send + Sync>,
    ) -> Self {
        Detector {
            inner: Arc::new(Inner {
                registry: Mutex::new(ThreadRegistry::new()),
                sampler,
                resolver: Mutex::new(resolver),
                callback,
                config,
                running: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Put a thread under observation
    ///
    /// Call once per thread, as soon as possible after it starts; the
    /// [`crate::TrackedThread`] wrapper does this automatically. There is
    /// no deregistration: a thread that exits is discovered by the next
    /// round and reported as interrupted.
    pub fn register(&self, identity: ThreadId, name: impl Into<String>) {
        let name = name.into();
        log::debug!("monitoring thread {name} ({identity})");
        self.inner.registry.lock().register(identity, name);
    }

    /// Run one polling round synchronously, without the watchdog loop
    ///
    /// For hosts (and tests) that drive polling themselves instead of
    /// calling [`Detector::run`].
    pub fn poll_once(&self) -> RoundOutcome {
        let mut registry = self.inner.registry.lock();
        self.inner.snapshot_locked(&mut registry, false)
    }

    /// Per-thread state as of the most recent round, registration order
    pub fn status(&self) -> Vec<ThreadStatus> {
        self.inner.registry.lock().statuses()
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Inner {
    /// One snapshot round under the registry lock
    ///
    /// Suspend-all completes before any classification; resume-all happens
    /// after all classification, on every path, because the guards resume
    /// on drop. Between the first suspension and resume-all nothing here
    /// allocates, formats, or logs: a parked thread may own the allocator
    /// or a stdio lock, and blocking on it would wedge the detector.
    pub(crate) fn snapshot_locked(
        &self,
        registry: &mut ThreadRegistry,
        retain_full_stacks: bool,
    ) -> RoundOutcome {
        let count = registry.len();
        let mut guards: Vec<(usize, Suspended)> = Vec::with_capacity(count);
        let mut vanished: Vec<usize> = Vec::with_capacity(count);
        let mut unresponsive: Vec<usize> = Vec::with_capacity(count);
        let mut scratch: Vec<usize> = Vec::with_capacity(MAX_UNWIND_DEPTH);

        if retain_full_stacks {
            for thread in registry.iter_mut() {
                thread.clear_frames();
            }
        }

        // 1. Suspend every valid thread. A thread the OS no longer knows
        //    leaves monitoring permanently; a transient refusal just skips
        //    this round.
        for (index, thread) in registry.iter_mut().enumerate() {
            if !thread.valid() {
                continue;
            }
            match self.sampler.suspend(thread.identity()) {
                Ok(guard) => guards.push((index, guard)),
                Err(SuspendError::Gone) => {
                    thread.invalidate();
                    vanished.push(index);
                }
                Err(SuspendError::Unresponsive) => unresponsive.push(index),
            }
        }

        // 2. Capture and classify while everyone is parked
        let mut outcome = RoundOutcome {
            suspended: guards.len(),
            ..Default::default()
        };
        for (index, guard) in &guards {
            let Some(thread) = registry.get_mut(*index) else {
                continue;
            };
            self.sampler.unwind(guard, &mut scratch);
            if retain_full_stacks {
                thread.retain_frames(&scratch);
            }
            match thread.classify(&scratch) {
                Classification::Idle => outcome.idle += 1,
                Classification::Active => outcome.active += 1,
                Classification::Unreadable => outcome.unreadable += 1,
            }
        }

        // 3. Resume-all; only now is it safe to touch shared sinks
        drop(guards);

        for &index in &vanished {
            if let Some(thread) = registry.get_mut(index) {
                log::warn!(
                    "thread {} ({}) has been removed from monitoring",
                    thread.name(),
                    thread.identity()
                );
            }
        }
        for &index in &unresponsive {
            if let Some(thread) = registry.get_mut(index) {
                log::warn!(
                    "thread {} ({}) skipped this round: {}",
                    thread.name(),
                    thread.identity(),
                    SuspendError::Unresponsive
                );
            }
        }

        // A round is deadlock evidence only when something was actually
        // observed idle and nothing observed active. Unreadable captures
        // neither trigger nor veto.
        outcome.deadlock_candidate =
            outcome.suspended > 0 && outcome.idle > 0 && outcome.active == 0;
        outcome
    }

    pub(crate) fn deadlock_info(&self, registry: &ThreadRegistry) -> DeadlockInfo {
        DeadlockInfo {
            threads: registry.statuses(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}
