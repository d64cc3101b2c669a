//! A reusable barrier shared across fork
//!
//! [`SignalBarrier`] keeps its state in an anonymous shared mapping, so it
//! must be created before the processes that use it are forked. Waiters
//! park in `sigtimedwait` on SIGUSR2; the last party to arrive sends that
//! signal to each waiting thread. A wait that times out or is interrupted
//! breaks the barrier for everybody waiting, and the last of them to leave
//! resets it for the next round.

use nix::errno::Errno;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Most parties a [`SignalBarrier`] can hold
pub const MAX_PARTIES: usize = 64;

const WAKE: Signal = Signal::SIGUSR2;

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("wait was interrupted by a signal")]
    Interrupted,

    #[error("barrier timed out after {0:?}")]
    Timeout(Duration),

    /// Another party timed out or was interrupted during this round
    #[error("barrier is broken")]
    Broken,

    /// `reset` while parties are still waiting
    #[error("{0} parties are still waiting")]
    Busy(usize),

    #[error("barrier system call failed: {0}")]
    Os(#[source] nix::Error),
}

pub trait Barrier {
    /// Block until every party has arrived. Returns this caller's arrival
    /// index; the last to arrive gets `parties() - 1`.
    fn wait(&self, timeout: Option<Duration>) -> Result<usize, BarrierError>;

    /// Bring a broken or idle barrier back to its initial state
    fn reset(&self) -> Result<(), BarrierError>;

    fn number_waiting(&self) -> usize;

    fn parties(&self) -> usize;
}

#[derive(Clone, Copy)]
#[repr(C)]
struct Waiter {
    pid: libc::pid_t,
    tid: libc::pid_t,
}

#[repr(C)]
struct Shared {
    lock: AtomicBool,
    parties: usize,
    arrived: usize,
    waiting: usize,
    broken: bool,
    /// Waiters that still have to leave a broken round
    unblocked: usize,
    generation: u64,
    waiters: [Waiter; MAX_PARTIES],
}

impl Shared {
    fn restart(&mut self) {
        self.arrived = 0;
        self.waiting = 0;
        self.broken = false;
        self.unblocked = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    fn wake_all(&self) {
        for waiter in &self.waiters[..self.waiting] {
            wake(*waiter);
        }
    }

    fn forget(&mut self, me: Waiter) {
        if let Some(index) = self.waiters[..self.waiting]
            .iter()
            .position(|w| w.pid == me.pid && w.tid == me.tid)
        {
            self.waiters.copy_within(index + 1..self.waiting, index);
            self.waiting -= 1;
        }
    }
}

/// Barrier for processes forked after its creation
pub struct SignalBarrier {
    shared: NonNull<Shared>,
}

// The mapping is only touched under its spin lock
unsafe impl Send for SignalBarrier {}
unsafe impl Sync for SignalBarrier {}

struct Guard<'a> {
    shared: &'a mut Shared,
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        self.shared.lock.store(false, Ordering::Release);
    }
}

impl SignalBarrier {
    pub fn new(parties: usize) -> Result<Self, BarrierError> {
        if parties == 0 || parties > MAX_PARTIES {
            return Err(BarrierError::Os(Errno::EINVAL));
        }
        // SAFETY: a fresh anonymous mapping, checked before use
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                std::mem::size_of::<Shared>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(BarrierError::Os(Errno::last()));
        }
        let shared = NonNull::new(ptr as *mut Shared).ok_or(BarrierError::Os(Errno::ENOMEM))?;
        // SAFETY: the mapping is large enough and suitably aligned for Shared
        unsafe {
            shared.as_ptr().write(Shared {
                lock: AtomicBool::new(false),
                parties,
                arrived: 0,
                waiting: 0,
                broken: false,
                unblocked: 0,
                generation: 0,
                waiters: [Waiter { pid: 0, tid: 0 }; MAX_PARTIES],
            });
        }
        Ok(Self { shared })
    }

    fn lock(&self) -> Guard<'_> {
        let ptr = self.shared.as_ptr();
        // SAFETY: the mapping lives as long as self and the flag is atomic
        let flag = unsafe { &(*ptr).lock };
        while flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        // SAFETY: the flag is held, so no other process or thread touches
        // the region until the guard drops
        Guard { shared: unsafe { &mut *ptr } }
    }

    pub fn is_broken(&self) -> bool {
        self.lock().shared.broken
    }

    /// Leave a round that ended without a release
    fn abandon(&self, me: Waiter, generation: u64, error: BarrierError) -> Result<usize, BarrierError> {
        let mut guard = self.lock();
        let shared = &mut *guard.shared;
        if shared.generation != generation {
            // Released while giving up: the wake signal is pending
            drop(guard);
            consume_pending();
            return Ok(0);
        }
        if shared.broken {
            // Someone else broke the round and has already signalled us
            shared.forget(me);
            shared.unblocked = shared.unblocked.saturating_sub(1);
            if shared.unblocked == 0 {
                shared.restart();
            }
            drop(guard);
            consume_pending();
            return Err(error);
        }
        shared.forget(me);
        shared.broken = true;
        shared.unblocked = shared.waiting;
        shared.wake_all();
        shared.waiting = 0;
        if shared.unblocked == 0 {
            shared.restart();
        }
        Err(error)
    }
}

impl Barrier for SignalBarrier {
    fn wait(&self, timeout: Option<Duration>) -> Result<usize, BarrierError> {
        let _mask = WakeMask::block()?;
        let me = current_waiter();

        let (index, generation) = {
            let mut guard = self.lock();
            let shared = &mut *guard.shared;
            if shared.broken {
                return Err(BarrierError::Broken);
            }
            let index = shared.arrived;
            shared.arrived += 1;
            if shared.arrived == shared.parties {
                shared.wake_all();
                shared.restart();
                return Ok(index);
            }
            shared.waiters[shared.waiting] = me;
            shared.waiting += 1;
            (index, shared.generation)
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match wait_for_wake(remaining) {
                Ok(()) => {
                    let mut guard = self.lock();
                    let shared = &mut *guard.shared;
                    if shared.generation != generation {
                        return Ok(index);
                    }
                    if shared.broken {
                        shared.unblocked = shared.unblocked.saturating_sub(1);
                        if shared.unblocked == 0 {
                            shared.restart();
                        }
                        return Err(BarrierError::Broken);
                    }
                    // Stray SIGUSR2, keep waiting
                }
                Err(Errno::EAGAIN) => {
                    let waited = timeout.unwrap_or_default();
                    return self
                        .abandon(me, generation, BarrierError::Timeout(waited))
                        .map(|_| index);
                }
                Err(Errno::EINTR) => {
                    return self
                        .abandon(me, generation, BarrierError::Interrupted)
                        .map(|_| index);
                }
                Err(e) => return Err(BarrierError::Os(e)),
            }
        }
    }

    fn reset(&self) -> Result<(), BarrierError> {
        let mut guard = self.lock();
        let shared = &mut *guard.shared;
        if shared.waiting > 0 {
            return Err(BarrierError::Busy(shared.waiting));
        }
        shared.restart();
        Ok(())
    }

    fn number_waiting(&self) -> usize {
        self.lock().shared.waiting
    }

    fn parties(&self) -> usize {
        self.lock().shared.parties
    }
}

impl Drop for SignalBarrier {
    fn drop(&mut self) {
        // SAFETY: unmaps only this process's view of the region
        unsafe {
            libc::munmap(self.shared.as_ptr() as *mut libc::c_void, std::mem::size_of::<Shared>());
        }
    }
}

/// SIGUSR2 stays blocked for the calling thread until this is dropped
struct WakeMask {
    previous: SigSet,
}

impl WakeMask {
    fn block() -> Result<Self, BarrierError> {
        let mut set = SigSet::empty();
        set.add(WAKE);
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(BarrierError::Os)?;
        Ok(Self { previous })
    }
}

impl Drop for WakeMask {
    fn drop(&mut self) {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

fn current_waiter() -> Waiter {
    // SAFETY: plain syscalls without arguments
    let (pid, tid) = unsafe { (libc::getpid(), libc::syscall(libc::SYS_gettid) as libc::pid_t) };
    Waiter { pid, tid }
}

/// Thread-directed, so a multi-threaded waiter cannot have the signal
/// land on some other thread
fn wake(waiter: Waiter) {
    // SAFETY: tgkill only sends a signal
    unsafe {
        libc::syscall(libc::SYS_tgkill, waiter.pid, waiter.tid, WAKE as libc::c_int);
    }
}

fn wake_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(WAKE);
    set
}

fn wait_for_wake(timeout: Option<Duration>) -> Result<(), Errno> {
    let set = wake_set();
    // SAFETY: set and timespec outlive the call; siginfo is not requested
    let rc = unsafe {
        match timeout {
            Some(timeout) => {
                let ts = libc::timespec {
                    tv_sec: timeout.as_secs() as libc::time_t,
                    tv_nsec: timeout.subsec_nanos() as libc::c_long,
                };
                libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &ts)
            }
            None => libc::sigwaitinfo(set.as_ref(), std::ptr::null_mut()),
        }
    };
    if rc < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

fn consume_pending() {
    let _ = wait_for_wake(Some(Duration::from_millis(100)));
}
