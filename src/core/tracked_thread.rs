use crate::core::detector::Detector;
use crate::core::types::current_thread_id;
use std::thread::{self, JoinHandle};

/// A wrapper around std::thread::JoinHandle that puts the spawned thread
/// under a detector's observation
pub struct TrackedThread<T>(JoinHandle<T>);

impl<T> TrackedThread<T>
where
    T: Send + 'static,
{
    /// Spawn a new monitored thread.
    /// Registration happens inside the new thread before `f` runs, so the
    /// registered identity is the thread's own OS id rather than a raced
    /// handoff from the spawner.
    pub fn spawn<F>(detector: &Detector, name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let detector = detector.clone();
        let name = name.into();
        let handle = thread::spawn(move || {
            detector.register(current_thread_id(), name);
            f()
        });
        TrackedThread(handle)
    }

    /// Wait for the thread to finish and return its result.
    pub fn join(self) -> thread::Result<T> {
        self.0.join()
    }
}
