// Core types
pub mod types;
pub use types::*;

// Stack fingerprinting and per-round classification
pub mod fingerprint;

// Thread registry
pub mod registry;

// Frame-chain walking
pub mod unwind;

// Cross-thread suspension backends
pub mod suspend;

// Best-effort symbol resolution
pub mod symbolize;

// Detection engine, watchdog loop, report writer
pub mod detector;
pub use detector::{Detector, RoundOutcome};

// Thread-creation wrapper
pub mod tracked_thread;
pub use tracked_thread::TrackedThread;

use crate::core::suspend::StackSampler;
use crate::core::symbolize::{BacktraceResolver, SymbolResolver};
use anyhow::Result;
use std::path::Path;
use std::time::Duration;

/// Hangwatch configuration struct
pub struct Hangwatch {
    tick: Duration,
    confirm_rounds: u32,
    report_path: Option<std::path::PathBuf>,
    callback: Box<dyn Fn(DeadlockInfo) + Send + Sync>,
    sampler: Option<Box<dyn StackSampler>>,
    resolver: Option<Box<dyn SymbolResolver>>,
}

impl Default for Hangwatch {
    fn default() -> Self {
        Self::new()
    }
}

impl Hangwatch {
    /// Create a new Hangwatch with default settings
    ///
    /// By default:
    /// - 100 ms polling interval, 50 confirmation rounds (~5 s of
    ///   sustained idleness before a deadlock is declared)
    /// - Report goes to stderr
    /// - Callback logs the deadlock information at error level
    /// - Platform suspension backend and in-process symbol resolver
    pub fn new() -> Self {
        Hangwatch {
            tick: Duration::from_millis(100),
            confirm_rounds: 50,
            report_path: None,
            callback: Box::new(|info: DeadlockInfo| {
                log::error!(
                    "deadlock detected: {}",
                    serde_json::to_string_pretty(&info).unwrap_or_else(|_| format!("{info:?}"))
                );
            }),
            sampler: None,
            resolver: None,
        }
    }

    /// Write hang reports to the given file instead of stderr
    ///
    /// # Arguments
    /// * `path` - Report destination, written as UTF-16-LE with a byte
    ///   order mark
    ///
    /// # Returns
    /// The builder for method chaining
    pub fn with_report_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.report_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the watchdog polling interval
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Set how many consecutive all-idle rounds confirm a deadlock
    pub fn with_confirmation_rounds(mut self, rounds: u32) -> Self {
        self.confirm_rounds = rounds;
        self
    }

    /// Set a custom callback to be invoked when a deadlock is declared
    ///
    /// # Arguments
    /// * `callback` - Function to call with the [`DeadlockInfo`]
    ///
    /// # Returns
    /// The builder for method chaining
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(DeadlockInfo) + Send + Sync + 'static,
    {
        self.callback = Box::new(callback);
        self
    }

    /// Replace the suspension backend
    ///
    /// Required on platforms without a built-in backend; also how tests
    /// script thread behavior without real threads.
    pub fn with_sampler(mut self, sampler: impl StackSampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Replace the symbol resolver
    pub fn with_resolver(mut self, resolver: impl SymbolResolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }

    /// Build the detector with the configured settings
    ///
    /// # Errors
    /// Fails when no suspension backend is available: on Linux when the
    /// capture signal handler cannot be installed, elsewhere when no
    /// sampler was injected with [`Hangwatch::with_sampler`].
    pub fn build(self) -> Result<Detector> {
        let sampler = match self.sampler {
            Some(sampler) => sampler,
            None => default_sampler()?,
        };
        let resolver = self
            .resolver
            .unwrap_or_else(|| Box::new(BacktraceResolver::new()));
        Ok(Detector::from_parts(
            detector::DetectorConfig {
                tick: self.tick,
                confirm_rounds: self.confirm_rounds,
                report_path: self.report_path,
            },
            sampler,
            resolver,
            self.callback,
        ))
    }

    /// Build the detector and start its background monitor
    ///
    /// # Errors
    /// Propagates [`Hangwatch::build`] and [`Detector::run`] failures.
    pub fn start(self) -> Result<Detector> {
        let detector = self.build()?;
        detector.run()?;
        Ok(detector)
    }
}

#[cfg(target_os = "linux")]
fn default_sampler() -> Result<Box<dyn StackSampler>> {
    Ok(Box::new(suspend::SignalSampler::new()?))
}

#[cfg(not(target_os = "linux"))]
fn default_sampler() -> Result<Box<dyn StackSampler>> {
    anyhow::bail!("no built-in suspension backend for this platform; supply one with Hangwatch::with_sampler")
}
