//! # Hangwatch
//!
//! A runtime watchdog that catches threads which have stopped for good.
//!
//! Hangwatch periodically freezes the threads it was told about, captures
//! each one's call stack without any cooperation from the thread itself,
//! and fingerprints the result. A stack that keeps changing is a thread
//! doing work; a fingerprint that stays frozen across the whole
//! confirmation window is a thread that is permanently stuck. When every
//! monitored thread sustains an unchanged fingerprint for the configured
//! number of rounds, a deadlock is declared and a symbolized report of
//! where each thread is blocked is written.
//!
//! ## Features
//!
//! - Sampling-based deadlock detection, no instrumentation of locks
//! - Cross-thread stack capture via brief OS-level suspension
//! - Best-effort symbol resolution (function, offset, file:line)
//! - Human-readable reports to a file or stderr, on demand or on
//!   declaration
//! - Injectable suspension and symbolization backends for testing and
//!   porting
//!
//! ## Example
//!
//! ```no_run
//! use hangwatch::{Hangwatch, TrackedThread};
//!
//! # fn main() -> anyhow::Result<()> {
//! let detector = Hangwatch::new()
//!     .with_report_file("hang_report.txt")
//!     .build()?;
//!
//! let _worker = TrackedThread::spawn(&detector, "worker-0", || {
//!     // ... long-running work ...
//! });
//!
//! detector.run()?;
//! // ... the rest of the application ...
//! detector.stop();
//! detector.wait_until_stopped();
//! # Ok(())
//! # }
//! ```
//!
//! ## Limitations
//!
//! The default capture walks the frame-pointer chain, which silently
//! truncates through code compiled without preserved frame pointers
//! (build with `-C force-frame-pointers=yes`, or enable the
//! `dwarf-unwind` feature for metadata-driven capture). Threads the
//! detector was never told about are not monitored, and nothing is done
//! about a detected deadlock beyond reporting it.

mod core;
pub use core::{
    Detector, Hangwatch, RoundOutcome, TrackedThread,
    suspend::{StackSampler, SuspendError, Suspended, ThreadContext},
    symbolize::{BacktraceResolver, Symbol, SymbolResolver},
    types::{DeadlockInfo, Fingerprint, ThreadId, ThreadStatus, current_thread_id},
    unwind::{FrameMemory, MAX_UNWIND_DEPTH, walk_frame_chain},
};

#[cfg(target_os = "linux")]
pub use core::suspend::SignalSampler;
