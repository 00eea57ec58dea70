//! Cross-thread suspension
//!
//! The snapshot engine needs to freeze an arbitrary registered thread,
//! read its execution context, and be certain the thread is resumed on
//! every exit path. That capability lives behind the [`StackSampler`]
//! trait so tests can script it and other platforms can supply their own
//! backend through `Hangwatch::with_sampler`.
//!
//! The Linux backend directs a realtime signal at the target task with
//! `tgkill`; the handler records the interrupted context into a static
//! slot table and parks inside the handler until the snapshot round
//! releases it. Parking in the handler is what makes the stack safe to
//! walk from the watchdog thread: the target cannot run, so its stack
//! cannot move.

use crate::core::types::ThreadId;
use std::fmt;

/// Why a thread could not be suspended this round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendError {
    /// The OS no longer knows the thread: it has exited. Permanent.
    Gone,
    /// The thread exists but did not park in time, or the backend is out
    /// of capacity. Transient; the next round retries.
    Unresponsive,
}

impl fmt::Display for SuspendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendError::Gone => write!(f, "thread no longer exists"),
            SuspendError::Unresponsive => write!(f, "thread did not acknowledge suspension"),
        }
    }
}

impl std::error::Error for SuspendError {}

/// Registers captured from a suspended thread
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContext {
    pub instruction_pointer: usize,
    pub frame_pointer: usize,
    pub stack_pointer: usize,
}

enum Release {
    None,
    #[cfg(target_os = "linux")]
    Slot(usize),
    Hook(Box<dyn FnOnce() + Send>),
}

/// A thread parked by [`StackSampler::suspend`]
///
/// Dropping the guard resumes the thread. Guards are scoped to a single
/// snapshot round and never held across rounds.
pub struct Suspended {
    thread: ThreadId,
    context: ThreadContext,
    release: Release,
}

impl Suspended {
    /// Guard for a backend that needs no explicit resume action
    pub fn new(thread: ThreadId, context: ThreadContext) -> Self {
        Suspended {
            thread,
            context,
            release: Release::None,
        }
    }

    /// Guard that runs `hook` exactly once when dropped
    pub fn with_release(
        thread: ThreadId,
        context: ThreadContext,
        hook: impl FnOnce() + Send + 'static,
    ) -> Self {
        Suspended {
            thread,
            context,
            release: Release::Hook(Box::new(hook)),
        }
    }

    #[cfg(target_os = "linux")]
    fn parked_in_slot(thread: ThreadId, context: ThreadContext, slot: usize) -> Self {
        Suspended {
            thread,
            context,
            release: Release::Slot(slot),
        }
    }

    #[cfg(all(target_os = "linux", feature = "dwarf-unwind"))]
    fn slot(&self) -> Option<usize> {
        match self.release {
            Release::Slot(index) => Some(index),
            _ => None,
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn context(&self) -> &ThreadContext {
        &self.context
    }
}

impl Drop for Suspended {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.release, Release::None) {
            Release::None => {}
            #[cfg(target_os = "linux")]
            Release::Slot(index) => signal::release_slot(index),
            Release::Hook(hook) => hook(),
        }
    }
}

/// Capability to suspend a thread and capture its call stack
///
/// `unwind` writes return addresses into `out` (cleared first, newest call
/// first, bounded by the unwind depth cap) and must not allocate beyond
/// `out`'s existing capacity while the target is parked: a parked thread
/// may own the allocator lock.
pub trait StackSampler: Send + Sync {
    fn suspend(&self, thread: ThreadId) -> Result<Suspended, SuspendError>;

    fn unwind(&self, suspended: &Suspended, out: &mut Vec<usize>);
}

#[cfg(target_os = "linux")]
pub use signal::SignalSampler;

#[cfg(target_os = "linux")]
mod signal {
    use super::{StackSampler, Suspended, SuspendError, ThreadContext};
    use crate::core::types::ThreadId;
    use crate::core::unwind::{self, StackWindow};
    use anyhow::{Result, bail};
    use std::sync::Once;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Upper bound on simultaneously parked threads
    const MAX_PARKED: usize = 64;

    /// How long to wait for the target's handler to acknowledge
    const ACK_TIMEOUT: Duration = Duration::from_millis(20);

    /// Rendezvous cell between the watchdog thread and one target's signal
    /// handler. Everything in here is touched from a handler, so it is
    /// atomics (plus a buffer ordered by the `captured` flag) only.
    struct ParkSlot {
        /// Kernel tid the slot is reserved for; 0 = free
        tid: AtomicU64,
        ip: AtomicUsize,
        fp: AtomicUsize,
        sp: AtomicUsize,
        /// Handler stored the context and is now parked
        captured: AtomicBool,
        /// Watchdog tells the parked handler to return
        released: AtomicBool,
        #[cfg(feature = "dwarf-unwind")]
        depth: AtomicUsize,
        #[cfg(feature = "dwarf-unwind")]
        frames: FrameBuf,
    }

    #[cfg(feature = "dwarf-unwind")]
    struct FrameBuf(std::cell::UnsafeCell<[usize; unwind::MAX_UNWIND_DEPTH]>);

    // Writes happen in the handler before `captured` is set with Release;
    // reads happen after observing it with Acquire.
    #[cfg(feature = "dwarf-unwind")]
    unsafe impl Sync for FrameBuf {}

    #[allow(clippy::declare_interior_mutable_const)]
    const FREE_SLOT: ParkSlot = ParkSlot {
        tid: AtomicU64::new(0),
        ip: AtomicUsize::new(0),
        fp: AtomicUsize::new(0),
        sp: AtomicUsize::new(0),
        captured: AtomicBool::new(false),
        released: AtomicBool::new(false),
        #[cfg(feature = "dwarf-unwind")]
        depth: AtomicUsize::new(0),
        #[cfg(feature = "dwarf-unwind")]
        frames: FrameBuf(std::cell::UnsafeCell::new([0; unwind::MAX_UNWIND_DEPTH])),
    };

    static SLOTS: [ParkSlot; MAX_PARKED] = [FREE_SLOT; MAX_PARKED];

    fn sample_signal() -> libc::c_int {
        libc::SIGRTMIN() + 6
    }

    static INSTALL: Once = Once::new();
    static INSTALL_OK: AtomicBool = AtomicBool::new(false);

    fn install_handler() -> Result<()> {
        INSTALL.call_once(|| unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = capture_handler as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(sample_signal(), &action, std::ptr::null_mut()) == 0 {
                INSTALL_OK.store(true, Ordering::SeqCst);
            }
        });
        if !INSTALL_OK.load(Ordering::SeqCst) {
            bail!("failed to install the capture signal handler");
        }
        Ok(())
    }

    /// Runs on the target thread. Async-signal-safe: atomics, register
    /// reads, and nanosleep only; errno is preserved.
    unsafe extern "C" fn capture_handler(
        _sig: libc::c_int,
        _info: *mut libc::siginfo_t,
        ctx: *mut libc::c_void,
    ) {
        let saved_errno = unsafe { *libc::__errno_location() };
        let tid = unsafe { libc::gettid() } as u64;
        for slot in SLOTS.iter() {
            if slot.tid.load(Ordering::Acquire) != tid {
                continue;
            }
            let (ip, fp, sp) = unsafe { read_context(ctx) };
            slot.ip.store(ip, Ordering::Relaxed);
            slot.fp.store(fp, Ordering::Relaxed);
            slot.sp.store(sp, Ordering::Relaxed);
            #[cfg(feature = "dwarf-unwind")]
            unsafe {
                capture_frames(slot)
            };
            slot.captured.store(true, Ordering::Release);
            // Parked: the watchdog walks our stack now. If it already gave
            // up on us (ack timeout), `released` is set and we fall straight
            // through.
            while !slot.released.load(Ordering::Acquire) {
                let pause = libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 50_000,
                };
                unsafe {
                    libc::nanosleep(&pause, std::ptr::null_mut());
                }
            }
            slot.released.store(false, Ordering::Relaxed);
            slot.tid.store(0, Ordering::Release);
            break;
        }
        unsafe {
            *libc::__errno_location() = saved_errno;
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn read_context(ctx: *mut libc::c_void) -> (usize, usize, usize) {
        let uc = ctx as *const libc::ucontext_t;
        let gregs = unsafe { &(*uc).uc_mcontext.gregs };
        (
            gregs[libc::REG_RIP as usize] as usize,
            gregs[libc::REG_RBP as usize] as usize,
            gregs[libc::REG_RSP as usize] as usize,
        )
    }

    #[cfg(target_arch = "aarch64")]
    unsafe fn read_context(ctx: *mut libc::c_void) -> (usize, usize, usize) {
        let uc = ctx as *const libc::ucontext_t;
        let mcontext = unsafe { &(*uc).uc_mcontext };
        (
            mcontext.pc as usize,
            mcontext.regs[29] as usize,
            mcontext.sp as usize,
        )
    }

    /// Metadata-driven capture, run on the target thread inside the handler.
    /// Universally correct where frame pointers are not preserved, at the
    /// cost of running the unwinder in signal context.
    #[cfg(feature = "dwarf-unwind")]
    unsafe fn capture_frames(slot: &ParkSlot) {
        let buffer = unsafe { &mut *slot.frames.0.get() };
        let mut depth = 0;
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                buffer[depth] = frame.ip() as usize;
                depth += 1;
                depth < buffer.len()
            });
        }
        slot.depth.store(depth, Ordering::Relaxed);
    }

    fn claim_slot(thread: ThreadId) -> Option<usize> {
        for (index, slot) in SLOTS.iter().enumerate() {
            if slot
                .tid
                .compare_exchange(0, thread, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.captured.store(false, Ordering::Relaxed);
                slot.released.store(false, Ordering::Relaxed);
                return Some(index);
            }
        }
        None
    }

    pub(super) fn release_slot(index: usize) {
        SLOTS[index].released.store(true, Ordering::Release);
    }

    #[cfg(feature = "dwarf-unwind")]
    fn read_precaptured(index: usize, out: &mut Vec<usize>) {
        let slot = &SLOTS[index];
        let depth = slot.depth.load(Ordering::Acquire).min(unwind::MAX_UNWIND_DEPTH);
        let buffer = unsafe { &*slot.frames.0.get() };
        out.clear();
        out.extend_from_slice(&buffer[..depth]);
    }

    /// Signal-directed suspension of threads in the current process
    pub struct SignalSampler {
        _private: (),
    }

    impl SignalSampler {
        /// Install the process-wide capture handler (once) and hand out a
        /// sampler. Multiple samplers share the handler and slot table.
        pub fn new() -> Result<Self> {
            install_handler()?;
            Ok(SignalSampler { _private: () })
        }
    }

    impl StackSampler for SignalSampler {
        fn suspend(&self, thread: ThreadId) -> Result<Suspended, SuspendError> {
            let Some(index) = claim_slot(thread) else {
                return Err(SuspendError::Unresponsive);
            };
            let slot = &SLOTS[index];
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    libc::getpid(),
                    thread as libc::pid_t,
                    sample_signal(),
                )
            };
            if rc != 0 {
                let gone =
                    std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH);
                slot.tid.store(0, Ordering::Release);
                return Err(if gone {
                    SuspendError::Gone
                } else {
                    SuspendError::Unresponsive
                });
            }
            let deadline = Instant::now() + ACK_TIMEOUT;
            while !slot.captured.load(Ordering::Acquire) {
                if Instant::now() >= deadline {
                    // The signal is in flight but the handler has not parked.
                    // Leave `released` set so a late handler resumes itself
                    // and frees the slot on its own.
                    slot.released.store(true, Ordering::Release);
                    return Err(SuspendError::Unresponsive);
                }
                std::hint::spin_loop();
            }
            slot.captured.store(false, Ordering::Relaxed);
            let context = ThreadContext {
                instruction_pointer: slot.ip.load(Ordering::Relaxed),
                frame_pointer: slot.fp.load(Ordering::Relaxed),
                stack_pointer: slot.sp.load(Ordering::Relaxed),
            };
            Ok(Suspended::parked_in_slot(thread, context, index))
        }

        fn unwind(&self, suspended: &Suspended, out: &mut Vec<usize>) {
            #[cfg(feature = "dwarf-unwind")]
            if let Some(index) = suspended.slot() {
                read_precaptured(index, out);
                return;
            }
            let window = StackWindow::above(suspended.context().stack_pointer);
            unwind::walk_frame_chain(&window, suspended.context().frame_pointer, out);
        }
    }
}
