//! Signal delivery through self-pipes
//!
//! The async handler only writes a byte into a socket; the loop polls the
//! read end like any other descriptor and does the real work (reaping,
//! staging triggers) on its own turn. SIGSTOP cannot be caught, so a
//! stopped child is noticed through the SIGCHLD its parent receives.

use crate::error::LoopError;
use log::debug;
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use signal_hook::SigId;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

/// Signals the loop reacts to
pub const WATCHED: [Signal; 3] = [Signal::SIGCHLD, Signal::SIGCONT, Signal::SIGTERM];

struct SignalPipe {
    signal: Signal,
    id: SigId,
    read: UnixStream,
}

pub struct SignalPipes {
    pipes: Vec<SignalPipe>,
}

impl SignalPipes {
    pub fn install() -> Result<Self, LoopError> {
        let mut pipes = Vec::with_capacity(WATCHED.len());
        for signal in WATCHED {
            let (read, write) = UnixStream::pair()?;
            read.set_nonblocking(true)?;
            write.set_nonblocking(true)?;
            let id = signal_hook::low_level::pipe::register(signal as libc::c_int, write)?;
            pipes.push(SignalPipe { signal, id, read });
        }
        Ok(Self { pipes })
    }

    /// Replace every pipe with a fresh pair. A forked child calls this so
    /// its signals no longer land in sockets it shares with the parent.
    pub fn reinstall(&mut self) -> Result<(), LoopError> {
        self.uninstall();
        *self = Self::install()?;
        Ok(())
    }

    fn uninstall(&mut self) {
        for pipe in self.pipes.drain(..) {
            signal_hook::low_level::unregister(pipe.id);
        }
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.pipes.iter().map(|p| p.read.as_raw_fd()).collect()
    }

    pub fn signal_for(&self, fd: RawFd) -> Option<Signal> {
        self.pipes
            .iter()
            .find(|p| p.read.as_raw_fd() == fd)
            .map(|p| p.signal)
    }

    /// Empty the self-pipe for `fd`. Several deliveries of one signal
    /// collapse into a single wake-up.
    pub fn drain(&self, fd: RawFd) -> usize {
        let Some(pipe) = self.pipes.iter().find(|p| p.read.as_raw_fd() == fd) else {
            return 0;
        };
        let mut total = 0;
        let mut buf = [0u8; 64];
        let mut stream = &pipe.read;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        total
    }
}

impl Drop for SignalPipes {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// Watched signals stay blocked for the calling thread until this is dropped
pub struct BlockedSignals {
    previous: SigSet,
}

impl BlockedSignals {
    pub fn block() -> Result<Self, LoopError> {
        let mut set = SigSet::empty();
        for signal in WATCHED {
            set.add(signal);
        }
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), Some(&mut previous))
            .map_err(LoopError::Signal)?;
        Ok(Self { previous })
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            debug!("failed to restore signal mask: {}", e);
        }
    }
}
