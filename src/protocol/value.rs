//! Typed values carried in header fields and message bodies.
//!
//! Every [`Value`] knows its own type signature, so a body can always be
//! described by concatenating the signatures of its values. Arrays carry an
//! explicit element signature so empty arrays stay well-typed.

use serde::Serialize;

use crate::error::{BusError, Result};

/// Maximum length of a type signature in bytes.
pub const MAX_SIGNATURE_LENGTH: usize = 255;

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Byte(u8),
    Bool(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// Homogeneous array; `element` is the signature of every item.
    Array {
        element: Signature,
        items: Vec<Value>,
    },
    Struct(Vec<Value>),
    /// Key/value pair; only valid as an array item.
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// Build an array of values sharing the given element signature.
    pub fn array(element: Signature, items: Vec<Value>) -> Self {
        Value::Array { element, items }
    }

    /// Build an `as` array from strings.
    pub fn string_array<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Array {
            element: Signature::from_static("s"),
            items: items.into_iter().map(|s| Value::Str(s.into())).collect(),
        }
    }

    /// Wrap a value in a variant.
    pub fn variant(inner: Value) -> Self {
        Value::Variant(Box::new(inner))
    }

    /// The type signature of this value.
    pub fn signature(&self) -> String {
        let mut out = String::new();
        self.write_signature(&mut out);
        out
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Value::Byte(_) => out.push('y'),
            Value::Bool(_) => out.push('b'),
            Value::Int16(_) => out.push('n'),
            Value::UInt16(_) => out.push('q'),
            Value::Int32(_) => out.push('i'),
            Value::UInt32(_) => out.push('u'),
            Value::Int64(_) => out.push('x'),
            Value::UInt64(_) => out.push('t'),
            Value::Double(_) => out.push('d'),
            Value::Str(_) => out.push('s'),
            Value::ObjectPath(_) => out.push('o'),
            Value::Signature(_) => out.push('g'),
            Value::Array { element, .. } => {
                out.push('a');
                out.push_str(element.as_str());
            }
            Value::Struct(fields) => {
                out.push('(');
                for field in fields {
                    field.write_signature(out);
                }
                out.push(')');
            }
            Value::DictEntry(key, value) => {
                out.push('{');
                key.write_signature(out);
                value.write_signature(out);
                out.push('}');
            }
            Value::Variant(_) => out.push('v'),
        }
    }

    /// Borrow the string content of `s`, `o` and `g` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::ObjectPath(p) => Some(p.as_str()),
            Value::Signature(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Items of an array value.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array { items, .. } => Some(items),
            _ => None,
        }
    }

    /// Look through any number of variant wrappers.
    pub fn unwrap_variant(&self) -> &Value {
        match self {
            Value::Variant(inner) => inner.unwrap_variant(),
            other => other,
        }
    }
}

/// Concatenated signature of a sequence of values.
pub fn signature_of(values: &[Value]) -> String {
    let mut out = String::new();
    for value in values {
        value.write_signature(&mut out);
    }
    out
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectPath> for Value {
    fn from(v: ObjectPath) -> Self {
        Value::ObjectPath(v)
    }
}

impl From<Signature> for Value {
    fn from(v: Signature) -> Self {
        Value::Signature(v)
    }
}

/// A validated object path such as `/org/freedesktop/DBus`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validate and wrap an object path.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !is_valid_object_path(&path) {
            return Err(BusError::Validation(format!("invalid object path: {:?}", path)));
        }
        Ok(Self(path))
    }

    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Wrap a path known to be valid.
    pub(crate) fn from_static(path: &'static str) -> Self {
        debug_assert!(is_valid_object_path(path));
        Self(path.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ObjectPath {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        ObjectPath::new(s)
    }
}

fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    rest.split('/').all(|element| {
        !element.is_empty()
            && element
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    })
}

/// A validated type signature: zero or more complete types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    /// Validate and wrap a signature.
    pub fn new(sig: impl Into<String>) -> Result<Self> {
        let sig = sig.into();
        if sig.len() > MAX_SIGNATURE_LENGTH {
            return Err(BusError::Validation(format!(
                "signature longer than {} bytes",
                MAX_SIGNATURE_LENGTH
            )));
        }
        let mut rest = sig.as_bytes();
        while !rest.is_empty() {
            match complete_type_len(rest, false) {
                Some(n) => rest = &rest[n..],
                None => {
                    return Err(BusError::Validation(format!("invalid signature: {:?}", sig)));
                }
            }
        }
        Ok(Self(sig))
    }

    /// Validate the element signature of an array: exactly one complete
    /// type, where a dict entry such as `{sv}` is allowed.
    pub fn element(sig: impl Into<String>) -> Result<Self> {
        let sig = sig.into();
        if complete_type_len(sig.as_bytes(), true) != Some(sig.len()) {
            return Err(BusError::Validation(format!(
                "invalid array element signature: {:?}",
                sig
            )));
        }
        Ok(Self(sig))
    }

    /// Wrap a literal known to be valid.
    pub(crate) fn from_static(sig: &'static str) -> Self {
        debug_assert!(Signature::new(sig).is_ok());
        Self(sig.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Split into single complete types.
    pub fn types(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut rest = self.0.as_str();
        while let Some(n) = complete_type_len(rest.as_bytes(), false) {
            let (head, tail) = rest.split_at(n);
            out.push(head);
            rest = tail;
        }
        out
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const BASIC_TYPES: &[u8] = b"ybnqiuxtdsogh";

/// Length in bytes of the single complete type at the start of `sig`.
///
/// Dict entries are only accepted directly inside an array.
pub(crate) fn complete_type_len(sig: &[u8], in_array: bool) -> Option<usize> {
    match *sig.first()? {
        b if BASIC_TYPES.contains(&b) || b == b'v' => Some(1),
        b'a' => Some(1 + complete_type_len(&sig[1..], true)?),
        b'(' => {
            if sig.get(1) == Some(&b')') {
                return None;
            }
            let mut i = 1;
            while *sig.get(i)? != b')' {
                i += complete_type_len(&sig[i..], false)?;
            }
            Some(i + 1)
        }
        b'{' if in_array => {
            if !BASIC_TYPES.contains(sig.get(1)?) {
                return None;
            }
            let i = 2 + complete_type_len(&sig[2..], false)?;
            (*sig.get(i)? == b'}').then_some(i + 1)
        }
        _ => None,
    }
}
