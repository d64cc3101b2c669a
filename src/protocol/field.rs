//! Protocol fields: the typed, positioned slots a [`ProtocolMessage`] is made of.
//!
//! Every field carries its wire type, its ordinal position inside the parent
//! message and a few schema flags:
//!
//! - `required`: optional fields are left off the wire when empty
//! - `protected`: only the transport may write the value
//! - `anonymous`: the field is addressed by position on the wire, its name is
//!   recovered from the receiver's schema
//!
//! [`ProtocolMessage`]: super::ProtocolMessage

use super::ProtocolMessage;
use super::ProtocolError;

/// Flag bit set in the options byte when the field is position-addressed
pub const FIELD_IS_ANONYMOUS: u8 = 8;

/// Mask selecting the wire type out of the options byte
pub const FIELD_TYPE_MASK: u8 = 0x07;

/// Wire type of a field (low bits of the options byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// int32 length prefix followed by raw bytes
    VariableBytes = 0,
    /// 4 bytes little-endian
    Int32 = 1,
    /// A nested message, encoded as a full frame
    Message = 2,
    /// A single byte, read as unsigned: a sender's -1 arrives as 255
    Byte = 4,
}

impl FieldType {
    /// Decode the wire type from an options byte
    pub fn from_options(options: u8) -> Result<Self, ProtocolError> {
        match options & FIELD_TYPE_MASK {
            0 => Ok(FieldType::VariableBytes),
            1 => Ok(FieldType::Int32),
            2 => Ok(FieldType::Message),
            4 => Ok(FieldType::Byte),
            other => Err(ProtocolError::UnknownFieldType(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::VariableBytes => "bytes",
            FieldType::Int32 => "int32",
            FieldType::Message => "message",
            FieldType::Byte => "byte",
        }
    }
}

/// A field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Bytes(Vec<u8>),
    Byte(u8),
    Message(Box<ProtocolMessage>),
}

impl Value {
    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Int32(_) => FieldType::Int32,
            Value::Bytes(_) => FieldType::VariableBytes,
            Value::Byte(_) => FieldType::Byte,
            Value::Message(_) => FieldType::Message,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<ProtocolMessage> for Value {
    fn from(v: ProtocolMessage) -> Self {
        Value::Message(Box::new(v))
    }
}

/// One named, positioned, typed slot of a message
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    position: u32,
    field_type: FieldType,
    required: bool,
    protected: bool,
    anonymous: bool,
    value: Option<Value>,
}

impl Field {
    fn with_type(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            position: 0,
            field_type,
            required: true,
            protected: false,
            anonymous: true,
            value: None,
        }
    }

    pub fn int32(name: &str) -> Self {
        Self::with_type(name, FieldType::Int32)
    }

    pub fn bytes(name: &str) -> Self {
        Self::with_type(name, FieldType::VariableBytes)
    }

    pub fn byte(name: &str) -> Self {
        Self::with_type(name, FieldType::Byte)
    }

    /// A nested message field; `prototype` gives the nested schema
    pub fn message(name: &str, prototype: ProtocolMessage) -> Self {
        let mut field = Self::with_type(name, FieldType::Message);
        field.value = Some(Value::Message(Box::new(prototype)));
        field
    }

    /// Mark the field optional: it is skipped on the wire while empty
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Mark the field as written by the transport only
    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// Send the field name on the wire instead of relying on its position
    pub fn named(mut self) -> Self {
        self.anonymous = false;
        self
    }

    pub(crate) fn at_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub(crate) fn decoded(
        name: String,
        position: u32,
        anonymous: bool,
        value: Value,
    ) -> Self {
        Self {
            name,
            position,
            field_type: value.field_type(),
            required: true,
            protected: false,
            anonymous,
            value: Some(value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }

    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub(crate) fn value_mut(&mut self) -> Option<&mut Value> {
        self.value.as_mut()
    }

    /// Store a value, checking it matches the declared wire type
    pub(crate) fn store(&mut self, value: Value) -> Result<(), ProtocolError> {
        if value.field_type() != self.field_type {
            return Err(ProtocolError::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.as_str(),
                found: value.field_type().as_str(),
            });
        }
        self.value = Some(value);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        match self.value.as_mut() {
            Some(Value::Message(nested)) => nested.reset(),
            _ => self.value = None,
        }
    }

    /// A field is empty when it holds no value (a nested message is empty
    /// when all of its own fields are)
    pub fn is_empty(&self) -> bool {
        match &self.value {
            None => true,
            Some(Value::Message(nested)) => nested.is_empty(),
            Some(_) => false,
        }
    }

    /// Required fields always go on the wire, optional ones only when set
    pub fn should_be_included(&self) -> bool {
        self.required || !self.is_empty()
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.value {
            None => write!(f, "{} = <empty>", self.name),
            Some(Value::Int32(v)) => write!(f, "{} = {}", self.name, v),
            Some(Value::Byte(v)) => write!(f, "{} = {}", self.name, v),
            Some(Value::Bytes(v)) => write!(f, "{} = {}", self.name, String::from_utf8_lossy(v)),
            Some(Value::Message(m)) => write!(f, "{} = {}", self.name, m),
        }
    }
}
