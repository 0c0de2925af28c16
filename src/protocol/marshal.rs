//! Value marshalling in either byte order.
//!
//! Alignment is always computed relative to the start of the buffer, so
//! callers must start a buffer at an 8-aligned offset of the message (the
//! message start or the body start).

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use super::value::{complete_type_len, ObjectPath, Signature, Value};
use crate::error::{BusError, Result};

/// Maximum encoded size of a single array.
pub const MAX_ARRAY_LENGTH: usize = 64 * 1024 * 1024;

/// Maximum container nesting accepted on decode.
const MAX_DEPTH: usize = 64;

/// Byte order of a message, declared by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Wire tag for this byte order.
    pub fn tag(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    /// Parse a wire tag. Any other byte is not a valid message start.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }

    pub(crate) fn read_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// Alignment required by the type starting with `code`.
fn alignment(code: u8) -> usize {
    match code {
        b'n' | b'q' => 2,
        b'b' | b'i' | b'u' | b's' | b'o' | b'a' | b'h' => 4,
        b'x' | b't' | b'd' | b'(' | b'{' => 8,
        _ => 1,
    }
}

/// Writes values into a growing buffer.
pub(crate) struct Encoder {
    buf: BytesMut,
    endian: Endian,
}

impl Encoder {
    pub(crate) fn new(endian: Endian) -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            endian,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn into_inner(self) -> BytesMut {
        self.buf
    }

    pub(crate) fn pad(&mut self, align: usize) {
        let rem = self.buf.len() % align;
        if rem != 0 {
            self.buf.put_bytes(0, align - rem);
        }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.pad(4);
        match self.endian {
            Endian::Little => self.buf.put_u32_le(v),
            Endian::Big => self.buf.put_u32(v),
        }
    }

    fn put_u16(&mut self, v: u16) {
        self.pad(2);
        match self.endian {
            Endian::Little => self.buf.put_u16_le(v),
            Endian::Big => self.buf.put_u16(v),
        }
    }

    fn put_u64(&mut self, v: u64) {
        self.pad(8);
        match self.endian {
            Endian::Little => self.buf.put_u64_le(v),
            Endian::Big => self.buf.put_u64(v),
        }
    }

    fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    fn put_signature(&mut self, s: &str) {
        self.buf.put_u8(s.len() as u8);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    /// Overwrite a previously reserved u32 slot.
    fn patch_u32(&mut self, at: usize, v: u32) {
        let bytes = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.buf[at..at + 4].copy_from_slice(&bytes);
    }

    pub(crate) fn write_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Bool(v) => self.put_u32(u32::from(*v)),
            Value::Int16(v) => self.put_u16(*v as u16),
            Value::UInt16(v) => self.put_u16(*v),
            Value::Int32(v) => self.put_u32(*v as u32),
            Value::UInt32(v) => self.put_u32(*v),
            Value::Int64(v) => self.put_u64(*v as u64),
            Value::UInt64(v) => self.put_u64(*v),
            Value::Double(v) => self.put_u64(v.to_bits()),
            Value::Str(s) => {
                if s.contains('\0') {
                    return Err(BusError::Validation("string contains NUL byte".into()));
                }
                self.put_string(s)
            }
            Value::ObjectPath(p) => self.put_string(p.as_str()),
            Value::Signature(s) => self.put_signature(s.as_str()),
            Value::Array { element, items } => {
                let elem = element.as_str();
                if complete_type_len(elem.as_bytes(), true) != Some(elem.len()) {
                    return Err(BusError::Validation(format!(
                        "array element signature {:?} is not a single complete type",
                        elem
                    )));
                }
                self.pad(4);
                let len_at = self.buf.len();
                self.put_u32(0);
                self.pad(alignment(elem.as_bytes()[0]));
                let start = self.buf.len();
                for item in items {
                    if item.signature() != elem {
                        return Err(BusError::Validation(format!(
                            "array item of type {:?} in array of {:?}",
                            item.signature(),
                            elem
                        )));
                    }
                    self.write_value(item)?;
                }
                let len = self.buf.len() - start;
                if len > MAX_ARRAY_LENGTH {
                    return Err(BusError::Validation("array exceeds 64 MiB".into()));
                }
                self.patch_u32(len_at, len as u32);
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(BusError::Validation("empty struct".into()));
                }
                self.pad(8);
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::DictEntry(key, val) => {
                self.pad(8);
                self.write_value(key)?;
                self.write_value(val)?;
            }
            Value::Variant(inner) => {
                let sig = inner.signature();
                Signature::new(sig.as_str())?;
                self.put_signature(&sig);
                self.write_value(inner)?;
            }
        }
        Ok(())
    }
}

/// Reads values from a complete message buffer.
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    depth: usize,
}

fn invalid(msg: impl Into<String>) -> BusError {
    BusError::InvalidMessage(msg.into())
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8], endian: Endian) -> Self {
        Self {
            buf,
            pos: 0,
            endian,
            depth: 0,
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub(crate) fn align(&mut self, align: usize) -> Result<()> {
        let rem = self.pos % align;
        if rem != 0 {
            self.take(align - rem)?;
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| invalid("unexpected end of message"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        let b = self.take(2)?;
        let b = [b[0], b[1]];
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let b = self.take(4)?;
        Ok(self.endian.read_u32([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(arr),
            Endian::Big => u64::from_be_bytes(arr),
        })
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(invalid("string not NUL terminated"));
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| invalid("string is not valid UTF-8"))
    }

    fn read_signature(&mut self) -> Result<Signature> {
        let len = self.read_u8()? as usize;
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err(invalid("signature not NUL terminated"));
        }
        let s = std::str::from_utf8(bytes).map_err(|_| invalid("signature is not ASCII"))?;
        Signature::new(s).map_err(|e| invalid(e.to_string()))
    }

    /// Read one value of the single complete type `sig`.
    pub(crate) fn read_value(&mut self, sig: &str) -> Result<Value> {
        let code = *sig.as_bytes().first().ok_or_else(|| invalid("empty type"))?;
        let value = match code {
            b'y' => Value::Byte(self.read_u8()?),
            b'b' => match self.read_u32()? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(invalid(format!("invalid boolean {}", other))),
            },
            b'n' => Value::Int16(self.read_u16()? as i16),
            b'q' => Value::UInt16(self.read_u16()?),
            b'i' => Value::Int32(self.read_u32()? as i32),
            b'u' => Value::UInt32(self.read_u32()?),
            b'x' => Value::Int64(self.read_u64()? as i64),
            b't' => Value::UInt64(self.read_u64()?),
            b'd' => Value::Double(f64::from_bits(self.read_u64()?)),
            b's' => Value::Str(self.read_string()?),
            b'o' => Value::ObjectPath(
                ObjectPath::new(self.read_string()?).map_err(|e| invalid(e.to_string()))?,
            ),
            b'g' => Value::Signature(self.read_signature()?),
            b'h' => return Err(invalid("unix file descriptors are not supported")),
            b'a' => self.nested(|d| d.read_array(&sig[1..]))?,
            b'(' => self.nested(|d| {
                d.align(8)?;
                let inner = &sig[1..sig.len() - 1];
                Ok(Value::Struct(d.read_sequence(inner)?))
            })?,
            b'v' => self.nested(|d| {
                let inner = d.read_signature()?;
                if inner.types().len() != 1 {
                    return Err(invalid("variant signature must be a single type"));
                }
                Ok(Value::Variant(Box::new(d.read_value(inner.as_str())?)))
            })?,
            other => return Err(invalid(format!("unknown type code {:?}", other as char))),
        };
        Ok(value)
    }

    fn nested<F>(&mut self, f: F) -> Result<Value>
    where
        F: FnOnce(&mut Self) -> Result<Value>,
    {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(invalid("containers nested too deeply"));
        }
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn read_array(&mut self, elem: &str) -> Result<Value> {
        let len = self.read_u32()? as usize;
        if len > MAX_ARRAY_LENGTH {
            return Err(invalid("array exceeds 64 MiB"));
        }
        let first = *elem.as_bytes().first().ok_or_else(|| invalid("array without element type"))?;
        self.align(alignment(first))?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| invalid("array runs past end of message"))?;
        let mut items = Vec::new();
        while self.pos < end {
            let item = if first == b'{' {
                self.align(8)?;
                let key = self.read_value(&elem[1..2])?;
                let val = self.read_value(&elem[2..elem.len() - 1])?;
                Value::DictEntry(Box::new(key), Box::new(val))
            } else {
                self.read_value(elem)?
            };
            items.push(item);
        }
        if self.pos != end {
            return Err(invalid("array contents overran declared length"));
        }
        let element = Signature::element(elem).map_err(|e| invalid(e.to_string()))?;
        Ok(Value::Array { element, items })
    }

    /// Read consecutive values described by a signature of complete types.
    pub(crate) fn read_sequence(&mut self, sig: &str) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        let mut rest = sig;
        while !rest.is_empty() {
            let n = complete_type_len(rest.as_bytes(), false)
                .ok_or_else(|| invalid(format!("invalid signature {:?}", sig)))?;
            let (head, tail) = rest.split_at(n);
            values.push(self.read_value(head)?);
            rest = tail;
        }
        Ok(values)
    }
}
