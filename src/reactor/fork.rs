//! Forking children and detaching from the terminal

use super::poller::Timers;
use super::signals::BlockedSignals;
use super::{Loop, RUNTIME_EXIT_CODE};
use crate::error::LoopError;
use crate::process::{Pipe, ProcessInfo};
use log::warn;
use nix::unistd::{fork, getpid, setsid, ForkResult};
use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

impl Loop {
    /// Fork a child process labelled `labels`, connected to this one by a
    /// socket pair.
    ///
    /// The parent gets the child's pid back. The child never returns: it
    /// rebuilds its own loop state, keeps the actions that survive fork,
    /// runs `child_setup` against its loop, runs the loop and exits with
    /// its exit code.
    ///
    /// Forking from inside an action handler works, but the running handler
    /// itself is not carried into the child.
    pub fn fork<F>(&mut self, labels: &[&str], child_setup: F) -> Result<i32, LoopError>
    where
        F: FnOnce(&mut Loop),
    {
        if !self.running {
            return Err(LoopError::NotRunning);
        }
        let (parent_end, child_end) = UnixStream::pair()?;
        let blocked = BlockedSignals::block()?;

        // SAFETY: the child only works on its own copy of the loop and
        // leaves through process::exit
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                drop(child_end);
                drop(blocked);
                let pid = child.as_raw();
                let record = ProcessInfo::new(pid, labels).with_parent(self.this_process.snapshot());
                self.this_process.add_child(record);
                let pipe_labels = labels.iter().map(|l| l.to_string()).collect();
                self.this_process.add_pipe(Pipe::new(pid, parent_end, pipe_labels)?)?;
                lifecycle!(self, "forked child {} {:?}", pid, labels);
                Ok(pid)
            }
            Ok(ForkResult::Child) => {
                drop(parent_end);
                self.enter_child(child_end, labels, blocked, child_setup)
            }
            Err(e) => Err(LoopError::Fork(e)),
        }
    }

    /// Fork a child that just runs its loop with the inherited actions
    pub fn spawn(&mut self, labels: &[&str]) -> Result<i32, LoopError> {
        self.fork(labels, |_| {})
    }

    fn enter_child<F>(
        &mut self,
        stream: UnixStream,
        labels: &[&str],
        blocked: BlockedSignals,
        child_setup: F,
    ) -> !
    where
        F: FnOnce(&mut Loop),
    {
        let parent = self.this_process.snapshot();
        let parent_pid = parent.pid;
        let parent_labels = parent.labels.clone();

        // Dropping the inherited record closes every pipe the parent had
        self.this_process = ProcessInfo::new(getpid().as_raw(), labels).with_parent(parent);
        self.decoders.clear();
        self.read_buffers.clear();
        self.write_buffers.clear();
        self.timers = Timers::new();
        self.interrupted = false;
        self.exit_code = 0;
        self.registry.clear_callbacks();

        if let Err(e) = self.signals.reinstall() {
            warn!("child {} cannot watch signals: {}", self.pid(), e);
            std::process::exit(RUNTIME_EXIT_CODE);
        }

        self.dispatcher.reset_staging();
        let mut dispatcher = std::mem::take(&mut self.dispatcher);
        dispatcher.retain_surviving(self);
        self.dispatcher = dispatcher;

        let attached = Pipe::new(parent_pid, stream, parent_labels)
            .map_err(LoopError::from)
            .and_then(|pipe| self.this_process.add_pipe(pipe));
        if let Err(e) = attached {
            warn!("child {} cannot reach parent {}: {}", self.pid(), parent_pid, e);
            std::process::exit(RUNTIME_EXIT_CODE);
        }
        drop(blocked);
        lifecycle!(self, "child {} of {} started", self.pid(), parent_pid);

        child_setup(self);
        let code = match self.run() {
            Ok(code) => code,
            Err(e) => {
                warn!("child {} failed: {}", self.pid(), e);
                RUNTIME_EXIT_CODE
            }
        };
        std::process::exit(code)
    }

    /// Double fork into a new session so the loop outlives its terminal.
    /// The intermediate processes exit; the caller continues in the
    /// grandchild.
    pub fn detach(&mut self) -> Result<(), LoopError> {
        // SAFETY: the parent side exits immediately without touching shared state
        if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(LoopError::Detach)? {
            unsafe { libc::_exit(0) };
        }
        setsid().map_err(LoopError::Detach)?;
        if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(LoopError::Detach)? {
            unsafe { libc::_exit(0) };
        }
        self.this_process.set_pid(getpid().as_raw());
        lifecycle!(self, "detached as {}", self.pid());
        Ok(())
    }

    /// Point stdin, stdout and stderr at /dev/null. Refused while
    /// lifecycle logging is on.
    pub fn close_standard_descriptors(&mut self) -> Result<(), LoopError> {
        if self.logging {
            return Err(LoopError::LoggingEnabled);
        }
        let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
        for fd in 0..=2 {
            nix::unistd::dup2(null.as_raw_fd(), fd).map_err(io::Error::from)?;
        }
        Ok(())
    }

    /// Set the name shown by ps and top for this process
    pub fn set_process_name(&mut self, name: &str) -> Result<(), LoopError> {
        let name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        nix::sys::prctl::set_name(&name).map_err(io::Error::from)?;
        Ok(())
    }
}
