use super::field::{Field, FieldType, Value};
use super::ProtocolError;

/// A self-describing message: protocol id, version and an ordered field list
///
/// Field order is fixed when the schema is built and decides each field's
/// wire position.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    id: i32,
    version: i32,
    fields: Vec<Field>,
}

impl ProtocolMessage {
    pub fn new(id: i32, version: i32) -> Self {
        Self {
            id,
            version,
            fields: Vec::new(),
        }
    }

    /// Append a field to the schema; its position is its index
    pub fn with_field(mut self, field: Field) -> Self {
        self.add_field(field);
        self
    }

    pub fn add_field(&mut self, field: Field) -> &mut Self {
        let position = self.fields.len() as u32;
        self.fields.push(field.at_position(position));
        self
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Result<&Field, ProtocolError> {
        self.fields
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| ProtocolError::UnknownField(name.to_string()))
    }

    fn field_mut(&mut self, name: &str) -> Result<&mut Field, ProtocolError> {
        self.fields
            .iter_mut()
            .find(|f| f.name() == name)
            .ok_or_else(|| ProtocolError::UnknownField(name.to_string()))
    }

    pub fn field_by_position(&self, position: u32) -> Result<&Field, ProtocolError> {
        self.fields
            .iter()
            .find(|f| f.position() == position)
            .ok_or(ProtocolError::UnknownPosition {
                position,
                protocol: self.id,
            })
    }

    /// Set a field value from application code. Protected fields are refused.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ProtocolError> {
        let field = self.field_mut(name)?;
        if field.is_protected() {
            return Err(ProtocolError::ProtectedField(name.to_string()));
        }
        field.store(value.into())
    }

    /// Set a field value bypassing protection (transport side)
    pub(crate) fn set_protected(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ProtocolError> {
        self.field_mut(name)?.store(value.into())
    }

    /// Empty a field so that an optional one is skipped on the next encode
    pub fn unset(&mut self, name: &str) -> Result<(), ProtocolError> {
        let field = self.field_mut(name)?;
        if field.is_protected() {
            return Err(ProtocolError::ProtectedField(name.to_string()));
        }
        field.clear();
        Ok(())
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.field(name).ok().and_then(|f| f.value())
    }

    pub fn int32(&self, name: &str) -> Option<i32> {
        match self.value(name) {
            Some(Value::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn byte(&self, name: &str) -> Option<u8> {
        match self.value(name) {
            Some(Value::Byte(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        match self.value(name) {
            Some(Value::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn message(&self, name: &str) -> Option<&ProtocolMessage> {
        match self.value(name) {
            Some(Value::Message(m)) => Some(m),
            _ => None,
        }
    }

    /// Mutable access to a nested message field
    pub fn message_mut(&mut self, name: &str) -> Option<&mut ProtocolMessage> {
        match self.field_mut(name).ok()?.value_mut() {
            Some(Value::Message(m)) => Some(m),
            _ => None,
        }
    }

    /// Merge a decoded field into this message.
    ///
    /// Anonymous fields get their name back from the schema slot at the same
    /// position. Named fields missing from the schema are appended as-is.
    pub(crate) fn apply(&mut self, mut decoded: Field) -> Result<(), ProtocolError> {
        if decoded.is_anonymous() {
            let name = self.field_by_position(decoded.position())?.name().to_string();
            decoded.set_name(&name);
        }

        let value = match decoded.value() {
            Some(v) => v.clone(),
            None => return Ok(()),
        };

        match self.fields.iter_mut().find(|f| f.name() == decoded.name()) {
            Some(slot) => slot.store(value),
            None => {
                self.fields.push(decoded);
                Ok(())
            }
        }
    }

    /// Clear every value, keeping the schema (and nested schemas)
    pub fn reset(&mut self) {
        for field in &mut self.fields {
            field.clear();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.iter().all(|f| f.is_empty())
    }

    /// The nested message schema declared at `position`, if any
    pub(crate) fn nested_prototype(&self, position: u32) -> Option<&ProtocolMessage> {
        let field = self.field_by_position(position).ok()?;
        if field.field_type() != FieldType::Message {
            return None;
        }
        match field.value() {
            Some(Value::Message(m)) => Some(m),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "protocol {} v{}: [ ", self.id, self.version)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", field)?;
        }
        write!(f, " ]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> ProtocolMessage {
        ProtocolMessage::new(7, 1)
            .with_field(Field::int32("counter"))
            .with_field(Field::bytes("payload").optional())
            .with_field(Field::int32("origin").protected())
    }

    #[test]
    fn test_positions_follow_declaration_order() {
        let message = schema();
        let positions: Vec<u32> = message.fields().iter().map(|f| f.position()).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(message.field_by_position(1).unwrap().name(), "payload");
    }

    #[test]
    fn test_protected_field_refused() {
        let mut message = schema();
        let err = message.set("origin", 10).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtectedField(_)));
        message.set_protected("origin", 10).unwrap();
        assert_eq!(message.int32("origin"), Some(10));
    }

    #[test]
    fn test_unknown_field() {
        let mut message = schema();
        assert!(matches!(
            message.set("nope", 1),
            Err(ProtocolError::UnknownField(_))
        ));
    }

    #[test]
    fn test_apply_anonymous_field_recovers_name() {
        let mut message = schema();
        let decoded = Field::decoded(String::new(), 1, true, Value::from("hi"));
        message.apply(decoded).unwrap();
        assert_eq!(message.bytes("payload"), Some(&b"hi"[..]));
    }

    #[test]
    fn test_apply_unknown_named_field_is_appended() {
        let mut message = schema();
        let decoded = Field::decoded("trace".to_string(), 9, false, Value::Int32(3));
        message.apply(decoded).unwrap();
        assert_eq!(message.int32("trace"), Some(3));
        assert_eq!(message.fields().len(), 4);
    }

    #[test]
    fn test_reset_keeps_schema() {
        let mut message = schema();
        message.set("counter", 4).unwrap();
        message.reset();
        assert!(message.is_empty());
        assert_eq!(message.fields().len(), 3);
    }
}
