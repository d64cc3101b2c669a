//! One dispatch pass
//!
//! 1. coalesce staged `message_received` arguments
//! 2. order actions by trigger priority (stable, so ties keep registration order)
//! 3. mark the process busy
//! 4. run every action whose trigger is armed, dropping non-persistent ones
//! 5. clear all staged arguments and de-arm the triggers that ran
//! 6. mark the process ready again
//!
//! Handlers get the context mutably, so they may add or remove actions or
//! even fork while the pass is running. The pass works from a list of action
//! ids and looks each one up again before running it; a handler is taken out
//! of its action while it runs and put back afterwards.

use super::{ActionId, LoopAction, RuntimeArg, RuntimeArgs, Trigger};
use std::collections::{HashMap, HashSet};

/// Whatever owns a [`Dispatcher`] and is handed to its actions
pub trait DispatchContext: Sized {
    fn dispatcher(&mut self) -> &mut Dispatcher<Self>;

    /// Called with `true` before a pass that has actions and `false` after
    fn set_busy(&mut self, _busy: bool) {}
}

pub struct Dispatcher<C> {
    actions: Vec<LoopAction<C>>,
    armed: HashSet<Trigger>,
    next_id: u64,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            armed: HashSet::new(),
            next_id: 1,
        }
    }
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mut action: LoopAction<C>) -> ActionId {
        let id = ActionId(self.next_id);
        self.next_id += 1;
        action.id = id;
        self.actions.push(action);
        id
    }

    pub fn remove(&mut self, id: ActionId) -> bool {
        let before = self.actions.len();
        self.actions.retain(|a| a.id != id);
        before != self.actions.len()
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.actions.iter().any(|a| a.id == id)
    }

    pub fn get(&self, id: ActionId) -> Option<&LoopAction<C>> {
        self.actions.iter().find(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn count(&self, trigger: Trigger) -> usize {
        self.actions.iter().filter(|a| a.trigger() == trigger).count()
    }

    pub fn is_armed(&self, trigger: Trigger) -> bool {
        self.armed.contains(&trigger)
    }

    /// Stage `arg` on every action bound to `trigger` and arm it.
    ///
    /// Returns true when one of those actions is immediate.
    pub fn stage(&mut self, trigger: Trigger, arg: Option<RuntimeArg>) -> bool {
        let mut immediate = false;
        for action in self.actions.iter_mut().filter(|a| a.trigger() == trigger) {
            if let Some(arg) = &arg {
                action.args.push(arg.clone());
            }
            immediate |= action.is_immediate();
        }
        self.armed.insert(trigger);
        immediate
    }

    /// Arm without staging anything
    pub fn arm(&mut self, trigger: Trigger) -> bool {
        self.stage(trigger, None)
    }

    /// Forget staged arguments and armed triggers
    pub fn reset_staging(&mut self) {
        for action in &mut self.actions {
            action.args = RuntimeArgs::default();
        }
        self.armed.clear();
    }

    /// Keep only the actions whose survival predicate holds for `ctx`
    pub fn retain_surviving(&mut self, ctx: &C) {
        self.actions.retain(|a| a.survives(ctx));
    }

    fn coalesce(&mut self) {
        for action in self
            .actions
            .iter_mut()
            .filter(|a| a.trigger() == Trigger::MessageReceived)
        {
            coalesce_messages(action.args.as_mut_vec());
        }
    }

    fn order(&self) -> Vec<ActionId> {
        let mut order: Vec<(i32, ActionId)> = self
            .actions
            .iter()
            .map(|a| (a.trigger().priority(), a.id))
            .collect();
        order.sort_by_key(|(priority, _)| *priority);
        order.into_iter().map(|(_, id)| id).collect()
    }

    fn position(&self, id: ActionId) -> Option<usize> {
        self.actions.iter().position(|a| a.id == id)
    }
}

impl<C: DispatchContext> Dispatcher<C> {
    /// Run one dispatch pass over `ctx`'s dispatcher. Returns how many
    /// actions ran.
    pub fn dispatch(ctx: &mut C) -> usize {
        let dispatcher = ctx.dispatcher();
        if dispatcher.actions.is_empty() {
            dispatcher.armed.clear();
            return 0;
        }
        dispatcher.coalesce();
        let order = dispatcher.order();

        ctx.set_busy(true);
        let mut fired = HashSet::new();
        let mut ran = 0;

        for id in order {
            let dispatcher = ctx.dispatcher();
            let Some(index) = dispatcher.position(id) else {
                continue;
            };
            let trigger = dispatcher.actions[index].trigger();
            if !dispatcher.armed.contains(&trigger) {
                continue;
            }
            let action = &mut dispatcher.actions[index];
            let Some(mut handler) = action.handler.take() else {
                continue;
            };
            let args = std::mem::take(&mut action.args);
            fired.insert(trigger);

            handler(ctx, &args);
            ran += 1;

            let dispatcher = ctx.dispatcher();
            if let Some(index) = dispatcher.position(id) {
                if dispatcher.actions[index].is_persistent() {
                    dispatcher.actions[index].handler = Some(handler);
                } else {
                    dispatcher.actions.remove(index);
                }
            }
        }

        let dispatcher = ctx.dispatcher();
        for action in &mut dispatcher.actions {
            action.args = RuntimeArgs::default();
        }
        for trigger in fired {
            dispatcher.armed.remove(&trigger);
        }
        ctx.set_busy(false);
        ran
    }
}

/// Collapse coalescing messages with the same payload into the last one
/// staged, keeping the slot of the first. Everything else stays in order.
pub fn coalesce_messages(args: &mut Vec<RuntimeArg>) {
    let mut out: Vec<RuntimeArg> = Vec::with_capacity(args.len());
    let mut slots: HashMap<[u8; 16], usize> = HashMap::new();

    for arg in args.drain(..) {
        let key = match &arg {
            RuntimeArg::Message(m) if m.is_coalescing() => Some(md5::compute(m.data()).0),
            _ => None,
        };
        let Some(key) = key else {
            out.push(arg);
            continue;
        };
        match slots.get(&key) {
            Some(&slot) => out[slot] = arg,
            None => {
                slots.insert(key, out.len());
                out.push(arg);
            }
        }
    }

    *args = out;
}
