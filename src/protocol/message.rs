//! The message model and its wire encoding.
//!
//! A [`Message`] is a type, a flags byte, a serial, a set of uniquely keyed
//! header fields and an ordered body. [`Message::encode`] and
//! [`Message::decode`] convert between that model and complete frames.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes};
use serde::Serialize;

use super::marshal::{Decoder, Encoder, Endian};
use super::value::{signature_of, ObjectPath, Signature, Value};
use super::wire_format::{flags, MAX_MESSAGE_SIZE, PREFIX_SIZE, PROTOCOL_VERSION};
use crate::error::{BusError, MethodError, Result};

/// Message type, second byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(MessageType::MethodCall),
            2 => Some(MessageType::MethodReturn),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::Signal),
            _ => None,
        }
    }
}

/// Header field codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum HeaderField {
    Path = 1,
    Interface = 2,
    Member = 3,
    ErrorName = 4,
    ReplySerial = 5,
    Destination = 6,
    Sender = 7,
    Signature = 8,
    UnixFds = 9,
}

impl HeaderField {
    /// Map a wire code; unknown codes return `None` and are skipped.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(HeaderField::Path),
            2 => Some(HeaderField::Interface),
            3 => Some(HeaderField::Member),
            4 => Some(HeaderField::ErrorName),
            5 => Some(HeaderField::ReplySerial),
            6 => Some(HeaderField::Destination),
            7 => Some(HeaderField::Sender),
            8 => Some(HeaderField::Signature),
            9 => Some(HeaderField::UnixFds),
            _ => None,
        }
    }

    /// Signature the field's value must have.
    fn expected_signature(self) -> &'static str {
        match self {
            HeaderField::Path => "o",
            HeaderField::ReplySerial | HeaderField::UnixFds => "u",
            HeaderField::Signature => "g",
            _ => "s",
        }
    }
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub endian: Endian,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub flags: u8,
    /// Zero until the connection allocates one at send time.
    pub serial: u32,
    pub headers: BTreeMap<HeaderField, Value>,
    pub body: Vec<Value>,
}

impl Message {
    fn new(kind: MessageType) -> Self {
        Self {
            endian: Endian::default(),
            kind,
            flags: 0,
            serial: 0,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// A method call on `member` of the object at `path`.
    pub fn method_call(path: ObjectPath, member: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::MethodCall);
        msg.headers.insert(HeaderField::Path, Value::ObjectPath(path));
        msg.headers
            .insert(HeaderField::Member, Value::Str(member.into()));
        msg
    }

    /// A signal `interface.member` emitted from `path`.
    pub fn signal(
        path: ObjectPath,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(MessageType::Signal);
        msg.headers.insert(HeaderField::Path, Value::ObjectPath(path));
        msg.headers
            .insert(HeaderField::Interface, Value::Str(interface.into()));
        msg.headers
            .insert(HeaderField::Member, Value::Str(member.into()));
        msg
    }

    /// A successful reply to the call with serial `reply_serial`.
    pub fn method_return(reply_serial: u32, destination: Option<&str>) -> Self {
        let mut msg = Self::new(MessageType::MethodReturn);
        msg.headers
            .insert(HeaderField::ReplySerial, Value::UInt32(reply_serial));
        if let Some(dest) = destination {
            msg.headers
                .insert(HeaderField::Destination, Value::Str(dest.to_string()));
        }
        msg
    }

    /// An error reply to the call with serial `reply_serial`.
    pub fn error(reply_serial: u32, destination: Option<&str>, error: &MethodError) -> Self {
        let mut msg = Self::new(MessageType::Error);
        msg.headers
            .insert(HeaderField::ReplySerial, Value::UInt32(reply_serial));
        msg.headers
            .insert(HeaderField::ErrorName, Value::Str(error.name.clone()));
        if let Some(dest) = destination {
            msg.headers
                .insert(HeaderField::Destination, Value::Str(dest.to_string()));
        }
        msg.with_body(error.body.clone())
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.headers
            .insert(HeaderField::Destination, Value::Str(destination.into()));
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.headers
            .insert(HeaderField::Interface, Value::Str(interface.into()));
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    /// Replace the body and keep the signature header in sync with it.
    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        let sig = signature_of(&body);
        if sig.is_empty() {
            self.headers.remove(&HeaderField::Signature);
        } else {
            // An invalid signature here is caught again by `validate`.
            let sig = Signature::new(sig.as_str()).unwrap_or_default();
            self.headers
                .insert(HeaderField::Signature, Value::Signature(sig));
        }
        self.body = body;
        self
    }

    fn header_str(&self, field: HeaderField) -> Option<&str> {
        self.headers.get(&field).and_then(Value::as_str)
    }

    pub fn path(&self) -> Option<&str> {
        self.header_str(HeaderField::Path)
    }

    pub fn interface(&self) -> Option<&str> {
        self.header_str(HeaderField::Interface)
    }

    pub fn member(&self) -> Option<&str> {
        self.header_str(HeaderField::Member)
    }

    pub fn error_name(&self) -> Option<&str> {
        self.header_str(HeaderField::ErrorName)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header_str(HeaderField::Destination)
    }

    pub fn sender(&self) -> Option<&str> {
        self.header_str(HeaderField::Sender)
    }

    pub fn signature(&self) -> &str {
        self.header_str(HeaderField::Signature).unwrap_or("")
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.headers
            .get(&HeaderField::ReplySerial)
            .and_then(Value::as_u32)
    }

    /// Whether sending this message registers a reply waiter.
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageType::MethodCall
            && !flags::has_flag(self.flags, flags::NO_REPLY_EXPECTED)
    }

    /// Check required header fields, header value types and the body
    /// signature. Does not look at the serial.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in &self.headers {
            let got = value.signature();
            if got != field.expected_signature() {
                return Err(BusError::Validation(format!(
                    "header {:?} has type {:?}, expected {:?}",
                    field,
                    got,
                    field.expected_signature()
                )));
            }
        }

        let required: &[HeaderField] = match self.kind {
            MessageType::MethodCall => &[HeaderField::Path, HeaderField::Member],
            MessageType::Signal => &[
                HeaderField::Path,
                HeaderField::Interface,
                HeaderField::Member,
            ],
            MessageType::MethodReturn => &[HeaderField::ReplySerial],
            MessageType::Error => &[HeaderField::ReplySerial, HeaderField::ErrorName],
        };
        for field in required {
            if !self.headers.contains_key(field) {
                return Err(BusError::Validation(format!(
                    "{:?} message is missing the {:?} header",
                    self.kind, field
                )));
            }
        }

        if self.reply_serial() == Some(0) {
            return Err(BusError::Validation("reply serial must not be 0".into()));
        }

        let body_sig = signature_of(&self.body);
        if body_sig != self.signature() {
            return Err(BusError::Validation(format!(
                "body has signature {:?} but header declares {:?}",
                body_sig,
                self.signature()
            )));
        }
        Signature::new(body_sig)?;
        Ok(())
    }

    /// Encode into a complete frame.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = Encoder::new(self.endian);
        for value in &self.body {
            body.write_value(value)?;
        }
        let body = body.into_inner();

        let fields = Value::Array {
            element: Signature::element("(yv)")?,
            items: self
                .headers
                .iter()
                .map(|(field, value)| {
                    Value::Struct(vec![
                        Value::Byte(*field as u8),
                        Value::variant(value.clone()),
                    ])
                })
                .collect(),
        };

        let mut enc = Encoder::new(self.endian);
        enc.put_u8(self.endian.tag());
        enc.put_u8(self.kind as u8);
        enc.put_u8(self.flags);
        enc.put_u8(PROTOCOL_VERSION);
        enc.put_u32(body.len() as u32);
        enc.put_u32(self.serial);
        enc.write_value(&fields)?;
        enc.pad(8);

        let total = enc.len() + body.len();
        if total > MAX_MESSAGE_SIZE as usize {
            return Err(BusError::Validation(format!(
                "message of {} bytes exceeds maximum {}",
                total, MAX_MESSAGE_SIZE
            )));
        }

        let mut out = enc.into_inner();
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode a complete frame. Every failure is a malformed-message error.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let invalid = |msg: &str| BusError::InvalidMessage(msg.to_string());

        if buf.len() < PREFIX_SIZE {
            return Err(invalid("message shorter than prefix"));
        }
        let endian = Endian::from_tag(buf[0]).ok_or_else(|| invalid("invalid byte order tag"))?;
        let kind = MessageType::from_code(buf[1]).ok_or_else(|| invalid("unknown message type"))?;
        let msg_flags = buf[2];
        if buf[3] != PROTOCOL_VERSION {
            return Err(invalid("unsupported protocol version"));
        }

        let mut dec = Decoder::new(buf, endian);
        dec.seek(4);
        let body_length = dec.read_u32()? as usize;
        let serial = dec.read_u32()?;
        if serial == 0 {
            return Err(invalid("serial must not be 0"));
        }

        let mut headers = BTreeMap::new();
        if let Value::Array { items, .. } = dec.read_value("a(yv)")? {
            for item in items {
                let Value::Struct(mut parts) = item else {
                    continue;
                };
                let (Some(Value::Variant(value)), Some(Value::Byte(code))) =
                    (parts.pop(), parts.pop())
                else {
                    continue;
                };
                if let Some(field) = HeaderField::from_code(code) {
                    if headers.insert(field, *value).is_some() {
                        return Err(invalid("duplicate header field"));
                    }
                }
            }
        }
        dec.align(8)?;

        let body_start = dec.position();
        if buf.len() - body_start != body_length {
            return Err(invalid("body length does not match frame size"));
        }

        let sig = match headers.get(&HeaderField::Signature) {
            Some(Value::Signature(sig)) => sig.as_str().to_string(),
            Some(_) => return Err(invalid("signature header has wrong type")),
            None => String::new(),
        };
        // Body alignment is relative to the body start, which is 8-aligned.
        let mut body_dec = Decoder::new(&buf[body_start..], endian);
        let body = body_dec.read_sequence(&sig)?;
        if body_dec.position() != body_length {
            return Err(invalid("trailing bytes after body"));
        }

        let msg = Message {
            endian,
            kind,
            flags: msg_flags,
            serial,
            headers,
            body,
        };
        msg.validate()
            .map_err(|e| BusError::InvalidMessage(e.to_string()))?;
        Ok(msg)
    }
}
