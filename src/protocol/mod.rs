//! Self-describing binary protocol used between processes of one tree
//!
//! - `field`: typed, positioned message slots
//! - `message`: [`ProtocolMessage`], an ordered field list with an id and version
//! - `codec`: frame encoding and the resumable [`StreamDecoder`]
//! - `registry`: per-loop schema registry and read callbacks
//! - `resolution`: the built-in routing message every loop understands

pub mod codec;
pub mod field;
pub mod message;
pub mod registry;
pub mod resolution;

pub use codec::{encode, read_header, FrameHeader, StreamDecoder, HEADER_LEN, MAX_FRAME_SIZE};
pub use field::{Field, FieldType, Value};
pub use message::ProtocolMessage;
pub use registry::{ProtocolRegistry, ReadCallback};
pub use resolution::{ResolutionMessage, RESOLUTION_PROTOCOL_ID, RESOLUTION_PROTOCOL_VERSION};

use thiserror::Error;

/// Errors raised while building, encoding or decoding messages
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not enough bytes yet; retry with the same buffer once more arrive
    #[error("insufficient data: need {needed} bytes, have {available}")]
    Insufficient { needed: usize, available: usize },

    #[error("no protocol registered with id {0}")]
    NotFound(i32),

    #[error("protocol with id {0} is already registered")]
    AlreadyRegistered(i32),

    #[error("unknown field type bits {0:#x}")]
    UnknownFieldType(u8),

    #[error("no field at position {position} in protocol {protocol}")]
    UnknownPosition { position: u32, protocol: i32 },

    #[error("no field named '{0}'")]
    UnknownField(String),

    #[error("field '{0}' is protected and set by the transport only")]
    ProtectedField(String),

    #[error("field '{field}' holds {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("length {0} exceeds the maximum frame size")]
    TooLarge(usize),

    #[error("field name is not valid UTF-8")]
    InvalidName,

    #[error("frame data overruns its declared length of {declared} bytes")]
    FrameOverrun { declared: usize },

    #[error("expected protocol {expected}, got {found}")]
    WrongProtocol { expected: i32, found: i32 },
}

impl ProtocolError {
    /// True for the "wait for more bytes" condition
    pub fn is_insufficient(&self) -> bool {
        matches!(self, ProtocolError::Insufficient { .. })
    }
}
