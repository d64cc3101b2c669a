use super::{ProtocolError, ProtocolMessage};
use std::collections::HashMap;

/// Callback invoked with every fully decoded message of one protocol id
pub type ReadCallback = Box<dyn FnMut(&ProtocolMessage)>;

/// Known message schemas, keyed by protocol id
///
/// Each reactor loop owns its registry; a forked child starts from a copy
/// and resets the callbacks (see [`ProtocolRegistry::clear_callbacks`]).
#[derive(Default)]
pub struct ProtocolRegistry {
    prototypes: HashMap<i32, ProtocolMessage>,
    callbacks: HashMap<i32, ReadCallback>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message schema. Registering a second schema under the same
    /// id is refused.
    pub fn register(&mut self, prototype: ProtocolMessage) -> Result<(), ProtocolError> {
        if self.prototypes.contains_key(&prototype.id()) {
            return Err(ProtocolError::AlreadyRegistered(prototype.id()));
        }
        let mut prototype = prototype;
        prototype.reset();
        self.prototypes.insert(prototype.id(), prototype);
        Ok(())
    }

    pub fn is_registered(&self, id: i32) -> bool {
        self.prototypes.contains_key(&id)
    }

    /// A fresh, empty message for `id`.
    ///
    /// The version is carried on the wire but any version of a registered id
    /// is accepted.
    pub fn instantiate(&self, id: i32, _version: i32) -> Result<ProtocolMessage, ProtocolError> {
        self.prototypes
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::NotFound(id))
    }

    pub fn set_read_callback<F>(&mut self, id: i32, callback: F)
    where
        F: FnMut(&ProtocolMessage) + 'static,
    {
        self.callbacks.insert(id, Box::new(callback));
    }

    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    /// Drop every schema and callback
    pub fn clear(&mut self) {
        self.prototypes.clear();
        self.callbacks.clear();
    }

    pub(crate) fn notify(&mut self, message: &ProtocolMessage) {
        if let Some(callback) = self.callbacks.get_mut(&message.id()) {
            callback(message);
        }
    }
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.prototypes.keys().collect();
        ids.sort();
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &ids)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
