//! Triggers and the actions bound to them
//!
//! A trigger names a kind of event. Any number of [`LoopAction`]s can be
//! bound to one. When the loop sees the event it stages a [`RuntimeArg`] on
//! every action bound to the trigger and arms it; the next dispatch pass
//! runs the armed actions in priority order (see [`dispatch`]).

pub mod dispatch;

pub use dispatch::{DispatchContext, Dispatcher};

use crate::process::ProcessSnapshot;
use crate::protocol::ResolutionMessage;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    BeforeDispatch,
    Stopped,
    Continued,
    Terminated,
    ChildTerminated,
    Orphaned,
    ChannelClosed,
    MessageReceived,
    /// File watch integration
    InotifyEvent,
    /// Async I/O integration
    EioEvent,
}

impl Trigger {
    pub const ALL: [Trigger; 10] = [
        Trigger::BeforeDispatch,
        Trigger::Stopped,
        Trigger::Continued,
        Trigger::Terminated,
        Trigger::ChildTerminated,
        Trigger::Orphaned,
        Trigger::ChannelClosed,
        Trigger::MessageReceived,
        Trigger::InotifyEvent,
        Trigger::EioEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::BeforeDispatch => "process_before_dispatch",
            Trigger::Stopped => "process_stopped",
            Trigger::Continued => "process_continued",
            Trigger::Terminated => "process_terminated",
            Trigger::ChildTerminated => "process_child_terminated",
            Trigger::Orphaned => "process_orphaned",
            Trigger::ChannelClosed => "process_channel_closed",
            Trigger::MessageReceived => "message_received",
            Trigger::InotifyEvent => "inotify_event",
            Trigger::EioEvent => "eio_event",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_str() == name)
    }

    /// Dispatch priority, lower runs first
    pub fn priority(&self) -> i32 {
        match self {
            Trigger::MessageReceived => -2,
            Trigger::ChildTerminated => -1,
            Trigger::Terminated => 0,
            Trigger::ChannelClosed => 1,
            Trigger::Orphaned => 2,
            Trigger::BeforeDispatch => 4,
            _ => 1000,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One staged argument
///
/// Process triggers carry the affected process, `message_received` carries
/// messages, `process_channel_closed` the peer pid and integration
/// triggers an opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeArg {
    Process(ProcessSnapshot),
    Message(ResolutionMessage),
    Pid(i32),
    Event(Vec<u8>),
}

/// The arguments staged on an action for one dispatch pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeArgs(Vec<RuntimeArg>);

impl RuntimeArgs {
    pub fn new(args: Vec<RuntimeArg>) -> Self {
        Self(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RuntimeArg> {
        self.0.iter()
    }

    pub fn messages(&self) -> impl Iterator<Item = &ResolutionMessage> {
        self.0.iter().filter_map(|a| match a {
            RuntimeArg::Message(m) => Some(m),
            _ => None,
        })
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessSnapshot> {
        self.0.iter().filter_map(|a| match a {
            RuntimeArg::Process(p) => Some(p),
            _ => None,
        })
    }

    pub fn pids(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.iter().filter_map(|a| match a {
            RuntimeArg::Pid(pid) => Some(*pid),
            RuntimeArg::Process(p) => Some(p.pid),
            _ => None,
        })
    }

    pub fn events(&self) -> impl Iterator<Item = &[u8]> {
        self.0.iter().filter_map(|a| match a {
            RuntimeArg::Event(e) => Some(e.as_slice()),
            _ => None,
        })
    }

    pub(crate) fn push(&mut self, arg: RuntimeArg) {
        self.0.push(arg);
    }

    pub(crate) fn as_mut_vec(&mut self) -> &mut Vec<RuntimeArg> {
        &mut self.0
    }
}

impl<'a> IntoIterator for &'a RuntimeArgs {
    type Item = &'a RuntimeArg;
    type IntoIter = std::slice::Iter<'a, RuntimeArg>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Handle returned when an action is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub(crate) u64);

pub type ActionHandler<C> = Box<dyn FnMut(&mut C, &RuntimeArgs)>;
pub type SurvivePredicate<C> = Box<dyn Fn(&C) -> bool>;

/// A handler bound to a trigger
///
/// Built persistent, not immediate and always surviving fork; the builder
/// methods change that.
pub struct LoopAction<C> {
    pub(crate) id: ActionId,
    trigger: Trigger,
    persistent: bool,
    immediate: bool,
    pub(crate) handler: Option<ActionHandler<C>>,
    survive: Option<SurvivePredicate<C>>,
    pub(crate) args: RuntimeArgs,
}

impl<C> LoopAction<C> {
    pub fn new<F>(trigger: Trigger, handler: F) -> Self
    where
        F: FnMut(&mut C, &RuntimeArgs) + 'static,
    {
        Self {
            id: ActionId(0),
            trigger,
            persistent: true,
            immediate: false,
            handler: Some(Box::new(handler)),
            survive: None,
            args: RuntimeArgs::default(),
        }
    }

    /// A non-persistent action is removed after it has run once
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Arming an immediate action cuts the current poll batch short
    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Keep the action in a forked child only when `predicate` holds for
    /// the child's context
    pub fn survive_fork<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&C) -> bool + 'static,
    {
        self.survive = Some(Box::new(predicate));
        self
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn args(&self) -> &RuntimeArgs {
        &self.args
    }

    pub(crate) fn survives(&self, ctx: &C) -> bool {
        self.handler.is_some() && self.survive.as_ref().map_or(true, |p| p(ctx))
    }
}

impl<C> fmt::Debug for LoopAction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopAction")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .field("persistent", &self.persistent)
            .field("immediate", &self.immediate)
            .field("args", &self.args.len())
            .finish()
    }
}
