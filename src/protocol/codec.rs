//! Wire codec for protocol messages
//!
//! All integers are little-endian. A frame is:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────────────────────────┐
//! │ protocol id  │   version    │ data length  │  fields (data length)   │
//! │  (4 bytes)   │  (4 bytes)   │  (4 bytes)   │                         │
//! └──────────────┴──────────────┴──────────────┴─────────────────────────┘
//! ```
//!
//! and each field inside the data section is:
//!
//! ```text
//! ┌─────────┬──────────┬───────────────────────────────┬─────────────────┐
//! │ options │ position │ name len + name (named only)  │ typed payload   │
//! │ (1)     │ (4)      │ (4 + n)                       │                 │
//! └─────────┴──────────┴───────────────────────────────┴─────────────────┘
//! ```
//!
//! `options` holds the wire type in its low bits plus [`FIELD_IS_ANONYMOUS`].
//! Payloads: int32 = 4 bytes, byte = 1 byte, bytes = int32 length + data,
//! nested message = a full frame.
//!
//! Decoding never consumes bytes it cannot fully interpret: a short buffer
//! yields [`ProtocolError::Insufficient`] and the caller retries with the
//! same bytes once more have arrived.

use super::field::{Field, FieldType, Value, FIELD_IS_ANONYMOUS};
use super::{ProtocolError, ProtocolMessage, ProtocolRegistry};

/// Size of the frame header (id, version, data length)
pub const HEADER_LEN: usize = 12;

/// Maximum frame or field payload size (10MB to prevent memory exhaustion)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// The three leading integers of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: i32,
    pub version: i32,
    pub data_len: usize,
}

fn need(bytes: &[u8], offset: usize, len: usize) -> Result<(), ProtocolError> {
    if bytes.len() < offset + len {
        return Err(ProtocolError::Insufficient {
            needed: offset + len,
            available: bytes.len(),
        });
    }
    Ok(())
}

fn read_u32(bytes: &[u8], offset: usize) -> Result<u32, ProtocolError> {
    need(bytes, offset, 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    Ok(u32::from_le_bytes(raw))
}

fn read_i32(bytes: &[u8], offset: usize) -> Result<i32, ProtocolError> {
    read_u32(bytes, offset).map(|v| v as i32)
}

fn read_len(bytes: &[u8], offset: usize, max: usize) -> Result<usize, ProtocolError> {
    let len = read_u32(bytes, offset)? as usize;
    if len > max {
        return Err(ProtocolError::TooLarge(len));
    }
    Ok(len)
}

/// Serialize a message into one frame
pub fn encode(message: &ProtocolMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    encode_into(message, &mut out);
    out
}

fn encode_into(message: &ProtocolMessage, out: &mut Vec<u8>) {
    let mut data = Vec::new();
    for field in message.fields() {
        if field.should_be_included() {
            pack_field(field, &mut data);
        }
    }

    out.extend_from_slice(&message.id().to_le_bytes());
    out.extend_from_slice(&message.version().to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(&data);
}

fn pack_field(field: &Field, out: &mut Vec<u8>) {
    let mut options = field.field_type() as u8;
    if field.is_anonymous() {
        options |= FIELD_IS_ANONYMOUS;
    }
    out.push(options);
    out.extend_from_slice(&field.position().to_le_bytes());
    if !field.is_anonymous() {
        out.extend_from_slice(&(field.name().len() as u32).to_le_bytes());
        out.extend_from_slice(field.name().as_bytes());
    }

    // Required fields without a value go out as their zero value
    match (field.field_type(), field.value()) {
        (_, Some(Value::Int32(v))) => out.extend_from_slice(&v.to_le_bytes()),
        (_, Some(Value::Byte(v))) => out.push(*v),
        (_, Some(Value::Bytes(v))) => {
            out.extend_from_slice(&(v.len() as u32).to_le_bytes());
            out.extend_from_slice(v);
        }
        (_, Some(Value::Message(m))) => encode_into(m, out),
        (FieldType::Int32, None) => out.extend_from_slice(&0i32.to_le_bytes()),
        (FieldType::Byte, None) => out.push(0),
        (FieldType::VariableBytes, None) => out.extend_from_slice(&0u32.to_le_bytes()),
        // A nested field always carries its schema, so this is a bare frame
        (FieldType::Message, None) => out.extend_from_slice(&[0u8; HEADER_LEN]),
    }
}

/// Read a frame header without consuming anything
pub fn read_header(bytes: &[u8]) -> Result<FrameHeader, ProtocolError> {
    need(bytes, 0, HEADER_LEN)?;
    Ok(FrameHeader {
        id: read_i32(bytes, 0)?,
        version: read_i32(bytes, 4)?,
        data_len: read_u32(bytes, 8)? as usize,
    })
}

/// Decode one field from the head of `bytes`.
///
/// Returns the field and the number of bytes it occupies. `schema` is the
/// message being decoded; it supplies nested schemas for anonymous
/// message fields.
pub fn unpack_field(
    bytes: &[u8],
    registry: &ProtocolRegistry,
    schema: &ProtocolMessage,
    max_len: usize,
) -> Result<(Field, usize), ProtocolError> {
    need(bytes, 0, 5)?;
    let options = bytes[0];
    let field_type = FieldType::from_options(options)?;
    let anonymous = options & FIELD_IS_ANONYMOUS != 0;
    let position = read_u32(bytes, 1)?;
    let mut offset = 5;

    let mut name = String::new();
    if !anonymous {
        let len = read_len(bytes, offset, max_len)?;
        offset += 4;
        need(bytes, offset, len)?;
        name = String::from_utf8(bytes[offset..offset + len].to_vec())
            .map_err(|_| ProtocolError::InvalidName)?;
        offset += len;
    }

    let value = match field_type {
        FieldType::Int32 => {
            let v = read_i32(bytes, offset)?;
            offset += 4;
            Value::Int32(v)
        }
        FieldType::Byte => {
            need(bytes, offset, 1)?;
            let v = bytes[offset];
            offset += 1;
            Value::Byte(v)
        }
        FieldType::VariableBytes => {
            let len = read_len(bytes, offset, max_len)?;
            offset += 4;
            need(bytes, offset, len)?;
            let v = bytes[offset..offset + len].to_vec();
            offset += len;
            Value::Bytes(v)
        }
        FieldType::Message => {
            let hint = if anonymous {
                schema.nested_prototype(position)
            } else {
                None
            };
            let (nested, used) = unpack_nested(&bytes[offset..], registry, hint, max_len)
                .map_err(|e| shift_insufficient(e, offset, bytes.len()))?;
            offset += used;
            Value::Message(Box::new(nested))
        }
    };

    Ok((Field::decoded(name, position, anonymous, value), offset))
}

// Insufficient errors from a sub-slice are reported against the whole buffer
fn shift_insufficient(err: ProtocolError, offset: usize, available: usize) -> ProtocolError {
    match err {
        ProtocolError::Insufficient { needed, .. } => ProtocolError::Insufficient {
            needed: needed + offset,
            available,
        },
        other => other,
    }
}

/// Decode a complete nested frame. Unlike the top-level stream decoder this
/// is all-or-nothing: the whole nested frame must be present.
fn unpack_nested(
    bytes: &[u8],
    registry: &ProtocolRegistry,
    hint: Option<&ProtocolMessage>,
    max_len: usize,
) -> Result<(ProtocolMessage, usize), ProtocolError> {
    let header = read_header(bytes)?;
    if header.data_len > max_len {
        return Err(ProtocolError::TooLarge(header.data_len));
    }
    need(bytes, HEADER_LEN, header.data_len)?;

    let mut message = match hint {
        Some(proto) if proto.id() == header.id => {
            let mut m = proto.clone();
            m.reset();
            m
        }
        _ => registry.instantiate(header.id, header.version)?,
    };

    let data = &bytes[HEADER_LEN..HEADER_LEN + header.data_len];
    let mut consumed = 0;
    while consumed < data.len() {
        let (field, used) = match unpack_field(&data[consumed..], registry, &message, max_len) {
            Ok(v) => v,
            // The nested frame is complete, so running short inside it
            // means its length prefix lied
            Err(e) if e.is_insufficient() => {
                return Err(ProtocolError::FrameOverrun {
                    declared: header.data_len,
                })
            }
            Err(e) => return Err(e),
        };
        consumed += used;
        message.apply(field)?;
    }

    Ok((message, HEADER_LEN + header.data_len))
}

/// A frame whose header has been read but whose fields are still arriving
#[derive(Debug)]
struct PendingFrame {
    message: ProtocolMessage,
    data_len: usize,
    consumed: usize,
}

/// Resumable decoder for one byte stream
///
/// [`StreamDecoder::read`] drains fully decoded fields from the front of the
/// buffer and remembers how far into the current frame it got, so the same
/// decoder can be fed again after more bytes arrive.
#[derive(Debug)]
pub struct StreamDecoder {
    pending: Option<PendingFrame>,
    max_frame: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            pending: None,
            max_frame,
        }
    }

    /// True while a frame header has been consumed but not all its fields
    pub fn is_mid_frame(&self) -> bool {
        self.pending.is_some()
    }

    /// Data bytes of the current frame consumed so far
    pub fn consumed(&self) -> usize {
        self.pending.as_ref().map(|p| p.consumed).unwrap_or(0)
    }

    /// Forget any partially decoded frame
    pub fn reset(&mut self) {
        self.pending = None;
    }

    /// Decode the next message from `buffer`.
    ///
    /// On success the message's registered read callback (if any) has been
    /// invoked and the decoder is ready for a new frame. On
    /// [`ProtocolError::Insufficient`] nothing undecodable was consumed and
    /// the call can be repeated once `buffer` has grown. Any other error
    /// leaves the stream position undefined.
    pub fn read(
        &mut self,
        buffer: &mut Vec<u8>,
        registry: &mut ProtocolRegistry,
    ) -> Result<ProtocolMessage, ProtocolError> {
        let mut frame = match self.pending.take() {
            Some(frame) => frame,
            None => {
                let header = read_header(buffer)?;
                if header.data_len > self.max_frame {
                    return Err(ProtocolError::TooLarge(header.data_len));
                }
                let message = registry.instantiate(header.id, header.version)?;
                buffer.drain(..HEADER_LEN);
                PendingFrame {
                    message,
                    data_len: header.data_len,
                    consumed: 0,
                }
            }
        };

        while frame.consumed < frame.data_len {
            // Fields never read past the end of their own frame
            let remaining = frame.data_len - frame.consumed;
            let window = &buffer[..buffer.len().min(remaining)];
            let (field, used) =
                match unpack_field(window, registry, &frame.message, self.max_frame) {
                    Ok(v) => v,
                    Err(e) if e.is_insufficient() && window.len() == remaining => {
                        return Err(ProtocolError::FrameOverrun {
                            declared: frame.data_len,
                        });
                    }
                    Err(e) => {
                        if e.is_insufficient() {
                            self.pending = Some(frame);
                        }
                        return Err(e);
                    }
                };
            buffer.drain(..used);
            frame.consumed += used;
            frame.message.apply(field)?;
        }

        registry.notify(&frame.message);
        Ok(frame.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn inner_schema() -> ProtocolMessage {
        ProtocolMessage::new(21, 1).with_field(Field::bytes("another_field"))
    }

    fn schema() -> ProtocolMessage {
        ProtocolMessage::new(20, 3)
            .with_field(Field::int32("destination"))
            .with_field(Field::bytes("data"))
            .with_field(Field::byte("flag").optional())
            .with_field(Field::message("wrapped", inner_schema()))
            .with_field(Field::bytes("note").named())
    }

    fn registry() -> ProtocolRegistry {
        let mut registry = ProtocolRegistry::new();
        registry.register(schema()).unwrap();
        registry.register(inner_schema()).unwrap();
        registry
    }

    fn sample() -> ProtocolMessage {
        let mut m = schema();
        m.set("destination", 5454).unwrap();
        m.set("data", "my data").unwrap();
        m.set("note", "named").unwrap();
        m.message_mut("wrapped")
            .unwrap()
            .set("another_field", "another value")
            .unwrap();
        m
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&ProtocolMessage::new(80, 1));
        assert_eq!(bytes, vec![80, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_int32_field_layout() {
        let mut m = ProtocolMessage::new(1, 1).with_field(Field::int32("x"));
        m.set("x", -2).unwrap();
        let bytes = encode(&m);
        // options = int32 | anonymous, position 0, value
        assert_eq!(&bytes[HEADER_LEN..], &[9, 0, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(read_header(&bytes).unwrap().data_len, 9);
    }

    #[test]
    fn test_named_field_layout() {
        let mut m = ProtocolMessage::new(1, 1).with_field(Field::byte("ab").named());
        m.set("ab", 7u8).unwrap();
        let bytes = encode(&m);
        assert_eq!(&bytes[HEADER_LEN..], &[4, 0, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 7]);
    }

    #[test]
    fn test_decode_full_message() {
        let mut registry = registry();
        let mut buffer = encode(&sample());
        let mut decoder = StreamDecoder::new();

        let decoded = decoder.read(&mut buffer, &mut registry).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(decoded.int32("destination"), Some(5454));
        assert_eq!(decoded.bytes("data"), Some(&b"my data"[..]));
        assert_eq!(decoded.bytes("note"), Some(&b"named"[..]));
        assert_eq!(decoded.byte("flag"), None);
        assert_eq!(
            decoded.message("wrapped").unwrap().bytes("another_field"),
            Some(&b"another value"[..])
        );
    }

    #[test]
    fn test_optional_empty_field_not_on_wire() {
        let mut with_flag = sample();
        with_flag.set("flag", 1u8).unwrap();
        let without = encode(&sample());
        let with = encode(&with_flag);
        // options + position + 1 byte payload
        assert_eq!(with.len() - without.len(), 6);
    }

    #[test]
    fn test_unknown_protocol_is_not_found() {
        let mut registry = ProtocolRegistry::new();
        let mut buffer = encode(&sample());
        let len = buffer.len();
        let err = StreamDecoder::new().read(&mut buffer, &mut registry).unwrap_err();
        assert!(matches!(err, ProtocolError::NotFound(20)));
        assert!(!err.is_insufficient());
        assert_eq!(buffer.len(), len);
    }

    #[test]
    fn test_short_header_is_insufficient() {
        let mut registry = registry();
        let mut buffer = encode(&sample())[..7].to_vec();
        let err = StreamDecoder::new().read(&mut buffer, &mut registry).unwrap_err();
        assert!(err.is_insufficient());
        assert_eq!(buffer.len(), 7);
    }

    #[test]
    fn test_resume_after_every_split() {
        let stream = encode(&sample());
        let mut registry = registry();

        for i in 1..stream.len() {
            let mut decoder = StreamDecoder::new();
            let mut buffer = stream[..i].to_vec();
            let err = decoder.read(&mut buffer, &mut registry).unwrap_err();
            assert!(err.is_insufficient(), "split at {} gave {:?}", i, err);

            buffer.extend_from_slice(&stream[i..]);
            let decoded = decoder.read(&mut buffer, &mut registry).unwrap();
            assert_eq!(decoded.int32("destination"), Some(5454), "split at {}", i);
            assert_eq!(decoded.bytes("data"), Some(&b"my data"[..]));
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut registry = registry();
        let mut second = sample();
        second.set("destination", 1).unwrap();
        let mut buffer = encode(&sample());
        buffer.extend(encode(&second));

        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.read(&mut buffer, &mut registry).unwrap().int32("destination"), Some(5454));
        assert_eq!(decoder.read(&mut buffer, &mut registry).unwrap().int32("destination"), Some(1));
        assert!(decoder.read(&mut buffer, &mut registry).unwrap_err().is_insufficient());
    }

    #[test]
    fn test_read_callback_invoked() {
        let mut registry = registry();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        registry.set_read_callback(20, move |m| {
            sink.borrow_mut().push(m.int32("destination").unwrap_or_default());
        });

        let mut buffer = encode(&sample());
        StreamDecoder::new().read(&mut buffer, &mut registry).unwrap();
        assert_eq!(*seen.borrow(), vec![5454]);
    }

    #[test]
    fn test_oversized_field_rejected() {
        let mut registry = registry();
        let mut buffer = encode(&sample());
        let mut decoder = StreamDecoder::with_max_frame(4);
        let err = decoder.read(&mut buffer, &mut registry).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge(_)));
    }

    #[test]
    fn test_byte_field_is_unsigned() {
        let mut registry = registry();
        let mut m = sample();
        m.set("flag", 0xffu8).unwrap();
        let mut buffer = encode(&m);
        let decoded = StreamDecoder::new().read(&mut buffer, &mut registry).unwrap();
        assert_eq!(decoded.byte("flag"), Some(255));
    }

    #[test]
    fn test_field_longer_than_its_frame() {
        let mut registry = registry();
        // data_len 9, but the bytes field at position 1 claims 100 bytes
        let mut buffer = vec![20, 0, 0, 0, 3, 0, 0, 0, 9, 0, 0, 0];
        buffer.extend([FieldType::VariableBytes as u8 | FIELD_IS_ANONYMOUS, 1, 0, 0, 0]);
        let tail = encode(&sample());

        let mut decoder = StreamDecoder::new();
        let mut partial = buffer.clone();
        partial.extend([100, 0]);
        assert!(decoder.read(&mut partial, &mut registry).unwrap_err().is_insufficient());

        // Once the whole frame is there the overrun is certain, whatever follows
        let mut decoder = StreamDecoder::new();
        buffer.extend([100, 0, 0, 0]);
        buffer.extend(&tail);
        let err = decoder.read(&mut buffer, &mut registry).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameOverrun { declared: 9 }));
    }
}
