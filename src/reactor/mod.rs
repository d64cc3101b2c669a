//! The reactor loop
//!
//! Each process of a tree runs one [`Loop`]. A turn polls the signal
//! self-pipes and every open pipe once, turns what it sees into staged
//! triggers, fires due timers, arms `process_before_dispatch` and runs one
//! dispatch pass. [`Loop::run`] repeats that until [`Loop::stop`], then
//! terminates and reaps the children before returning (root) or exiting
//! the process (forked child).

macro_rules! lifecycle {
    ($lp:expr, $($arg:tt)+) => {
        if $lp.logging {
            log::info!($($arg)+)
        } else {
            log::debug!($($arg)+)
        }
    };
}

pub mod fork;
pub mod io;
pub mod poller;
pub mod routing;
pub mod signals;

pub use poller::TimerId;
pub use routing::{DescriptorRoute, ResolutionRoute, Route};

use crate::action::{ActionId, DispatchContext, Dispatcher, LoopAction, RuntimeArg, RuntimeArgs, Trigger};
use crate::config::LoopConfig;
use crate::error::LoopError;
use crate::process::{
    Availability, ProcessInfo, ProcessStatus, ResourceUsage, StatusChange, ALL_PIPES,
};
use crate::protocol::{ProtocolRegistry, ResolutionMessage, StreamDecoder};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{getpid, Pid};
use poller::{Interest, Readiness, Timers};
use signals::SignalPipes;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// An action registered on a [`Loop`]
pub type Action = LoopAction<Loop>;

pub type TimerHandler = Box<dyn FnMut(&mut Loop)>;

/// Largest exit code an application may set
pub const MAX_EXIT_CODE: i32 = 254;

/// Exit code of a forked child whose loop itself failed
pub const RUNTIME_EXIT_CODE: i32 = 255;

pub struct Loop {
    running: bool,
    config: LoopConfig,
    logging: bool,
    exit_code: i32,
    this_process: ProcessInfo,
    registry: ProtocolRegistry,
    dispatcher: Dispatcher<Loop>,
    timers: Timers<TimerHandler>,
    interrupted: bool,
    signals: SignalPipes,
    decoders: HashMap<RawFd, StreamDecoder>,
    read_buffers: HashMap<RawFd, Vec<u8>>,
    write_buffers: HashMap<RawFd, VecDeque<Vec<u8>>>,
}

impl DispatchContext for Loop {
    fn dispatcher(&mut self) -> &mut Dispatcher<Self> {
        &mut self.dispatcher
    }

    fn set_busy(&mut self, busy: bool) {
        self.this_process.set_availability(if busy {
            Availability::Working
        } else {
            Availability::Ready
        });
    }
}

impl Loop {
    /// A root loop with the default configuration
    pub fn new(labels: &[&str]) -> Result<Self, LoopError> {
        Self::with_config(LoopConfig::default(), labels)
    }

    pub fn with_config(config: LoopConfig, labels: &[&str]) -> Result<Self, LoopError> {
        let signals = SignalPipes::install()?;
        let mut registry = ProtocolRegistry::new();
        ResolutionMessage::register(&mut registry)?;

        let mut lp = Self {
            running: true,
            logging: config.logging,
            config,
            exit_code: 0,
            this_process: ProcessInfo::root(getpid().as_raw(), labels),
            registry,
            dispatcher: Dispatcher::new(),
            timers: Timers::new(),
            interrupted: false,
            signals,
            decoders: HashMap::new(),
            read_buffers: HashMap::new(),
            write_buffers: HashMap::new(),
        };
        lp.install_builtin_actions();
        Ok(lp)
    }

    fn install_builtin_actions(&mut self) {
        // A child record goes away once it has exited and its pipe is gone;
        // an open pipe may still hold its last messages
        self.dispatcher.add(Action::new(Trigger::ChildTerminated, |lp, args| {
            for pid in args.pids() {
                if lp.this_process.pipe(pid).map_or(true, |p| p.is_closed()) {
                    lp.free_pipe(pid);
                    lp.this_process.remove_child(pid);
                }
            }
        }));
        self.dispatcher.add(Action::new(Trigger::Terminated, |lp, _| lp.stop()));
        self.dispatcher.add(Action::new(Trigger::ChannelClosed, |lp, args| {
            for pid in args.pids() {
                lp.free_pipe(pid);
                let exited = lp
                    .this_process
                    .child(pid)
                    .map_or(false, |c| c.status() == ProcessStatus::Exited);
                if exited {
                    lp.this_process.remove_child(pid);
                }
            }
        }));
    }

    // Queries

    pub fn pid(&self) -> i32 {
        self.this_process.pid()
    }

    pub fn process(&self) -> &ProcessInfo {
        &self.this_process
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ProtocolRegistry {
        &mut self.registry
    }

    // Settings

    pub fn set_exit_code(&mut self, code: i32) -> Result<(), LoopError> {
        if !(0..=MAX_EXIT_CODE).contains(&code) {
            return Err(LoopError::ExitCode(code));
        }
        self.exit_code = code;
        Ok(())
    }

    /// Longest a turn waits for events when no timer is due sooner
    pub fn set_default_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Report lifecycle events at info level instead of debug
    pub fn set_logging_enabled(&mut self, enabled: bool) {
        self.logging = enabled;
    }

    pub fn is_logging_enabled(&self) -> bool {
        self.logging
    }

    // Actions

    pub fn add_action(&mut self, action: Action) -> ActionId {
        self.dispatcher.add(action)
    }

    /// Bind a persistent handler to `trigger`
    pub fn on<F>(&mut self, trigger: Trigger, handler: F) -> ActionId
    where
        F: FnMut(&mut Loop, &RuntimeArgs) + 'static,
    {
        self.dispatcher.add(Action::new(trigger, handler))
    }

    pub fn remove_action(&mut self, id: ActionId) -> bool {
        self.dispatcher.remove(id)
    }

    pub fn has_action(&self, id: ActionId) -> bool {
        self.dispatcher.contains(id)
    }

    pub fn action_count(&self) -> usize {
        self.dispatcher.len()
    }

    /// Stage an integration event (file watch, async I/O, ...) for the next
    /// dispatch pass
    pub fn raise(&mut self, trigger: Trigger, payload: Vec<u8>) {
        self.stage(trigger, Some(RuntimeArg::Event(payload)));
    }

    pub(crate) fn stage(&mut self, trigger: Trigger, arg: Option<RuntimeArg>) {
        if self.dispatcher.stage(trigger, arg) {
            self.interrupted = true;
        }
    }

    /// Run one dispatch pass now
    pub fn dispatch(&mut self) -> usize {
        Dispatcher::dispatch(self)
    }

    // Timers

    /// Run `handler` every `interval`. `max_executions` of `None` repeats
    /// until removed or the loop stops.
    pub fn add_periodic_timer<F>(
        &mut self,
        interval: Duration,
        max_executions: Option<u64>,
        start_now: bool,
        handler: F,
    ) -> TimerId
    where
        F: FnMut(&mut Loop) + 'static,
    {
        self.timers
            .add(interval, Box::new(handler), max_executions, start_now, Instant::now())
    }

    pub fn remove_timer(&mut self, id: TimerId) -> bool {
        self.timers.remove(id)
    }

    fn fire_timers(&mut self) {
        for id in self.timers.due(Instant::now()) {
            if !self.running {
                break;
            }
            let Some(mut handler) = self.timers.begin(id) else {
                continue;
            };
            handler(self);
            self.timers.finish(id, handler, Instant::now());
        }
    }

    // Lifecycle

    /// Leave the run loop after the current turn. Timers are dropped.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        lifecycle!(self, "stopping loop {}", self.pid());
        self.running = false;
        self.interrupted = true;
        self.timers.clear();
    }

    /// Send SIGTERM to every child and to this process, so termination
    /// goes through `process_terminated` once the current pass is done
    pub fn shutdown(&mut self) -> Result<(), LoopError> {
        for pid in self.this_process.child_pids() {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", pid, e);
            }
        }
        kill(getpid(), Signal::SIGTERM).map_err(LoopError::Signal)
    }

    /// Run until stopped, then terminate and reap the children.
    ///
    /// The root gets its exit code back. A forked child exits the process
    /// with it instead, or with [`RUNTIME_EXIT_CODE`] when the loop failed.
    pub fn run(&mut self) -> Result<i32, LoopError> {
        if let Some(name) = self.config.process_name.clone() {
            if let Err(e) = self.set_process_name(&name) {
                warn!("cannot set process name '{}': {}", name, e);
            }
        }
        lifecycle!(self, "loop {} running", self.pid());

        let mut result = Ok(());
        while self.running {
            if let Err(e) = self.run_once() {
                warn!("loop {} failed: {}", self.pid(), e);
                result = Err(e);
                self.stop();
            }
        }

        self.flush_all();
        self.drain_children();
        self.free_pipe(ALL_PIPES);
        lifecycle!(self, "loop {} done, exit code {}", self.pid(), self.exit_code);

        if !self.this_process.is_root() {
            std::process::exit(if result.is_ok() { self.exit_code } else { RUNTIME_EXIT_CODE });
        }
        result.map(|_| self.exit_code)
    }

    /// One turn: poll, handle events, fire timers, dispatch
    pub fn run_once(&mut self) -> Result<(), LoopError> {
        let now = Instant::now();
        let mut timeout = self.config.timeout;
        if let Some(next) = self.timers.next_timeout(now) {
            timeout = timeout.min(next);
        }
        if self.interrupted || !self.running {
            timeout = Duration::ZERO;
        }

        let ready = poller::poll(&self.interests(), timeout)?;
        for readiness in ready {
            if self.interrupted {
                break;
            }
            self.handle_readiness(readiness);
        }

        self.fire_timers();
        self.stage(Trigger::BeforeDispatch, None);
        self.dispatch();
        self.interrupted = false;
        Ok(())
    }

    fn interests(&self) -> Vec<Interest> {
        let mut interests: Vec<Interest> = self
            .signals
            .fds()
            .into_iter()
            .map(|fd| Interest { fd, read: true, write: false })
            .collect();
        interests.extend(
            self.this_process
                .pipes()
                .iter()
                .filter(|p| !p.is_closed())
                .map(|p| Interest {
                    fd: p.fd(),
                    read: true,
                    write: p.wants_write(),
                }),
        );
        interests
    }

    fn handle_readiness(&mut self, readiness: Readiness) {
        if let Some(signal) = self.signals.signal_for(readiness.fd) {
            self.signals.drain(readiness.fd);
            self.handle_signal(signal);
            return;
        }
        if readiness.readable || readiness.hangup {
            self.handle_readable(readiness.fd);
        }
        if readiness.writable {
            self.flush_descriptor(readiness.fd);
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::SIGTERM => {
                lifecycle!(self, "loop {} received SIGTERM", self.pid());
                self.this_process.set_status(
                    ProcessStatus::Exited,
                    "terminated by SIGTERM",
                    ResourceUsage::current(),
                );
                let snapshot = self.this_process.snapshot();
                self.stage(Trigger::Terminated, Some(RuntimeArg::Process(snapshot)));
            }
            _ => {
                self.reap_children();
            }
        }
    }

    /// Collect every child status change available without blocking
    fn reap_children(&mut self) -> usize {
        let mut reaped = 0;
        loop {
            match wait_any(true) {
                Ok(Some((pid, status, usage))) => {
                    self.record_wait(pid, status, usage);
                    reaped += 1;
                }
                Ok(None) => break,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    if reaped == 0 {
                        debug!("signal without a child to reap");
                    }
                    break;
                }
                Err(e) => {
                    warn!("wait4 failed: {}", e);
                    break;
                }
            }
        }
        reaped
    }

    fn record_wait(&mut self, pid: i32, raw_status: i32, usage: ResourceUsage) {
        let status = match WaitStatus::from_raw(Pid::from_raw(pid), raw_status) {
            Ok(status) => status,
            Err(e) => {
                warn!("unreadable wait status {:#x} for {}: {}", raw_status, pid, e);
                return;
            }
        };
        let Some(change) = StatusChange::from_wait(status) else {
            return;
        };
        let trigger = match change.status {
            ProcessStatus::Exited => Trigger::ChildTerminated,
            ProcessStatus::Stopped => Trigger::Stopped,
            ProcessStatus::Running => Trigger::Continued,
        };

        if self.this_process.child(pid).is_none() {
            debug!("wait reported unknown child {}", pid);
            self.this_process.add_child(ProcessInfo::placeholder(pid));
        }
        let Some(child) = self.this_process.child_mut(pid) else {
            return;
        };
        child.apply(&change, usage);
        lifecycle!(self, "child {} {}", pid, change.reason);
        let snapshot = child.snapshot();
        self.stage(trigger, Some(RuntimeArg::Process(snapshot)));
    }

    /// SIGTERM the children, then block until every one has been reaped,
    /// dispatching after each
    fn drain_children(&mut self) {
        // Already reaped, only kept around for their unread pipes
        for pid in self.this_process.child_pids() {
            let exited = self
                .this_process
                .child(pid)
                .map_or(false, |c| c.status() == ProcessStatus::Exited);
            if exited {
                self.free_pipe(pid);
                self.this_process.remove_child(pid);
            }
        }

        let children = self.this_process.child_pids();
        if children.is_empty() {
            return;
        }
        lifecycle!(self, "terminating {} children", children.len());
        for pid in children {
            let pid = Pid::from_raw(pid);
            // A stopped child would never act on the SIGTERM
            let _ = kill(pid, Signal::SIGTERM);
            let _ = kill(pid, Signal::SIGCONT);
        }

        loop {
            match wait_any(false) {
                Ok(Some((pid, status, usage))) => {
                    self.record_wait(pid, status, usage);
                    // Nothing is read any more, so the pipe holds nothing wanted
                    let exited = self
                        .this_process
                        .child(pid)
                        .map_or(false, |c| c.status() == ProcessStatus::Exited);
                    if exited {
                        self.free_pipe(pid);
                    }
                    self.dispatch();
                }
                Ok(None) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    warn!("wait4 failed while draining children: {}", e);
                    break;
                }
            }
        }
    }

    /// Free the pipes to `pid` (or all) along with their buffers
    pub(crate) fn free_pipe(&mut self, pid: i32) -> usize {
        let fds: Vec<RawFd> = self
            .this_process
            .pipes()
            .iter()
            .filter(|p| pid == ALL_PIPES || p.pid() == pid)
            .map(|p| p.fd())
            .collect();
        for fd in fds {
            self.forget_descriptor(fd);
        }
        self.this_process.free_pipe(pid)
    }

    pub(crate) fn forget_descriptor(&mut self, fd: RawFd) {
        self.decoders.remove(&fd);
        self.read_buffers.remove(&fd);
        self.write_buffers.remove(&fd);
    }
}

/// `wait4(-1)` for stops, continues and exits. `Ok(None)` when nothing is
/// ready in non-blocking mode.
fn wait_any(nohang: bool) -> Result<Option<(i32, i32, ResourceUsage)>, Errno> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data that wait4 fills in
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let mut flags = libc::WUNTRACED | libc::WCONTINUED;
    if nohang {
        flags |= libc::WNOHANG;
    }
    let pid = unsafe { libc::wait4(-1, &mut status, flags, &mut usage) };
    match pid {
        -1 => Err(Errno::last()),
        0 => Ok(None),
        pid => Ok(Some((pid, status, ResourceUsage::from(&usage)))),
    }
}
