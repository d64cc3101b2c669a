use super::{Field, ProtocolError, ProtocolMessage, ProtocolRegistry};

pub const RESOLUTION_PROTOCOL_ID: i32 = 80;
pub const RESOLUTION_PROTOCOL_VERSION: i32 = 1;

const DESTINATION_LABEL: &str = "destination_label";
const SENT_AT: &str = "sent_at";
const COALESCE: &str = "coalesce";
const DESTINATION_PID: &str = "destination_pid";
const BROADCAST: &str = "broadcast";
const SOURCE_PID: &str = "source_pid";
const PREVIOUS_PID: &str = "previous_pid";
const DATA: &str = "data";

/// The routing message exchanged between loops
///
/// Addressed by destination pid and/or label, or flagged as broadcast.
/// `source_pid` and `previous_pid` are stamped by the transport; they can be
/// read here but only the crate can write them.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionMessage {
    inner: ProtocolMessage,
}

impl Default for ResolutionMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionMessage {
    /// The wire schema, in wire order
    pub fn schema() -> ProtocolMessage {
        ProtocolMessage::new(RESOLUTION_PROTOCOL_ID, RESOLUTION_PROTOCOL_VERSION)
            .with_field(Field::bytes(DESTINATION_LABEL))
            .with_field(Field::int32(SENT_AT))
            .with_field(Field::byte(COALESCE).optional())
            .with_field(Field::int32(DESTINATION_PID))
            .with_field(Field::int32(BROADCAST).optional())
            .with_field(Field::int32(SOURCE_PID).protected())
            .with_field(Field::int32(PREVIOUS_PID).optional().protected())
            .with_field(Field::bytes(DATA))
    }

    pub fn register(registry: &mut ProtocolRegistry) -> Result<(), ProtocolError> {
        if registry.is_registered(RESOLUTION_PROTOCOL_ID) {
            return Ok(());
        }
        registry.register(Self::schema())
    }

    pub fn new() -> Self {
        Self {
            inner: Self::schema(),
        }
    }

    /// A message for every process carrying `label`
    pub fn to_label(label: &str, data: impl AsRef<[u8]>) -> Self {
        let mut m = Self::new();
        m.set_destination_label(label);
        m.set_data(data);
        m
    }

    /// A message for exactly one process
    pub fn to_pid(pid: i32, data: impl AsRef<[u8]>) -> Self {
        let mut m = Self::new();
        m.set_destination_pid(pid);
        m.set_data(data);
        m
    }

    /// A message for every process of the tree
    pub fn broadcast(data: impl AsRef<[u8]>) -> Self {
        let mut m = Self::new();
        m.set_broadcast(true);
        m.set_data(data);
        m
    }

    /// Wrap a decoded message, checking its protocol id
    pub fn from_message(inner: ProtocolMessage) -> Result<Self, ProtocolError> {
        if inner.id() != RESOLUTION_PROTOCOL_ID {
            return Err(ProtocolError::WrongProtocol {
                expected: RESOLUTION_PROTOCOL_ID,
                found: inner.id(),
            });
        }
        Ok(Self { inner })
    }

    pub fn as_message(&self) -> &ProtocolMessage {
        &self.inner
    }

    pub fn into_message(self) -> ProtocolMessage {
        self.inner
    }

    // The schema is fixed, so setting its own fields with matching types
    // cannot fail
    fn put(&mut self, name: &str, value: impl Into<super::Value>) {
        let _ = self.inner.set_protected(name, value);
    }

    pub fn set_destination_label(&mut self, label: &str) -> &mut Self {
        self.put(DESTINATION_LABEL, label);
        self
    }

    pub fn set_destination_pid(&mut self, pid: i32) -> &mut Self {
        self.put(DESTINATION_PID, pid);
        self
    }

    pub fn set_data(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.put(DATA, data.as_ref());
        self
    }

    /// Coalescing messages with an identical payload collapse into the most
    /// recent one before dispatch
    pub fn set_coalesce(&mut self, coalesce: bool) -> &mut Self {
        if coalesce {
            self.put(COALESCE, 1u8);
        } else {
            let _ = self.inner.unset(COALESCE);
        }
        self
    }

    pub fn set_broadcast(&mut self, broadcast: bool) -> &mut Self {
        if broadcast {
            self.put(BROADCAST, 1);
        } else {
            let _ = self.inner.unset(BROADCAST);
        }
        self
    }

    pub(crate) fn set_sent_at(&mut self, seconds: i32) {
        self.put(SENT_AT, seconds);
    }

    pub(crate) fn stamp_source(&mut self, pid: i32) {
        self.put(SOURCE_PID, pid);
    }

    pub(crate) fn stamp_previous(&mut self, pid: i32) {
        self.put(PREVIOUS_PID, pid);
    }

    /// Empty label is treated as "no label"
    pub fn destination_label(&self) -> Option<&str> {
        self.inner
            .bytes(DESTINATION_LABEL)
            .and_then(|b| std::str::from_utf8(b).ok())
            .filter(|s| !s.is_empty())
    }

    /// Zero is treated as "no pid"
    pub fn destination_pid(&self) -> Option<i32> {
        self.inner.int32(DESTINATION_PID).filter(|pid| *pid != 0)
    }

    pub fn sent_at(&self) -> i32 {
        self.inner.int32(SENT_AT).unwrap_or_default()
    }

    pub fn is_coalescing(&self) -> bool {
        self.inner.byte(COALESCE) == Some(1)
    }

    pub fn is_broadcast(&self) -> bool {
        self.inner.int32(BROADCAST) == Some(1)
    }

    pub fn source_pid(&self) -> i32 {
        self.inner.int32(SOURCE_PID).unwrap_or_default()
    }

    pub fn previous_pid(&self) -> Option<i32> {
        self.inner.int32(PREVIOUS_PID)
    }

    pub fn data(&self) -> &[u8] {
        self.inner.bytes(DATA).unwrap_or_default()
    }
}

impl std::fmt::Display for ResolutionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}
