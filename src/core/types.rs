use serde::{Deserialize, Serialize};

/// Thread identifier type
///
/// On Linux this is the kernel task id (`gettid`), which is what the
/// suspension backend needs to direct a signal at one specific thread.
/// On other platforms it is an opaque per-process counter; a platform
/// backend supplied through `Hangwatch::with_sampler` decides what the
/// value means.
pub type ThreadId = u64;

/// Compact summary of a captured call stack
///
/// Zero means "no usable capture" and is never treated as evidence that a
/// thread is idle.
pub type Fingerprint = u64;

/// Get the identifier of the calling thread, stable for the thread's lifetime
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> ThreadId {
    // gettid never fails
    (unsafe { libc::gettid() }) as ThreadId
}

#[cfg(not(target_os = "linux"))]
mod fallback_id {
    use super::ThreadId;
    use std::sync::atomic::{AtomicU64, Ordering};

    static THREAD_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

    thread_local! {
        static THREAD_ID: ThreadId = THREAD_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    }

    /// Get a unique identifier of the current thread
    pub fn current_thread_id() -> ThreadId {
        THREAD_ID.with(|&id| id)
    }
}

#[cfg(not(target_os = "linux"))]
pub use fallback_id::current_thread_id;

/// State of one monitored thread as of the most recent polling round
///
/// Returned by `Detector::status` and embedded in [`DeadlockInfo`] so hosts
/// can inspect or serialize what the watchdog saw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadStatus {
    /// Identifier supplied at registration
    pub id: ThreadId,
    /// Human-readable label supplied at registration
    pub name: String,
    /// False once the OS reported the thread gone; never becomes true again
    pub valid: bool,
    /// Classification result of the most recent round
    pub idle: bool,
    /// Consecutive rounds with an unchanged, non-zero stack fingerprint
    pub idle_streak: u32,
}

/// Represents the result of a deadlock declaration
///
/// Produced when every monitored thread has kept an unchanged stack
/// fingerprint for the full confirmation window. Passed to the deadlock
/// callback alongside the written report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlockInfo {
    /// Status of every registered thread at declaration time, in
    /// registration order (invalid threads included, marked as such)
    pub threads: Vec<ThreadStatus>,

    /// ISO-8601 timestamp of when the deadlock was declared
    pub timestamp: String,
}
