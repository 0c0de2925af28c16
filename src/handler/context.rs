//! Inbound method call context.
//!
//! A [`MethodCall`] is what an exported handler receives: the addressing
//! headers of the call plus its body. The reply is built from the value the
//! handler returns, so the context itself never touches the writer.
//!
//! # Example
//!
//! ```ignore
//! async fn echo(call: MethodCall) -> HandlerResult {
//!     Ok(call.into_body())
//! }
//! ```

use crate::protocol::{flags, Message, MessageType, ObjectPath, Value};

/// An inbound method call addressed to one of our exported objects.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    serial: u32,
    flags: u8,
    sender: Option<String>,
    path: ObjectPath,
    interface: Option<String>,
    member: String,
    body: Vec<Value>,
}

impl MethodCall {
    /// Build a context from a decoded message.
    ///
    /// Returns `None` unless the message is a method call with a path and
    /// member.
    pub(crate) fn from_message(msg: Message) -> Option<Self> {
        if msg.kind != MessageType::MethodCall {
            return None;
        }
        let path = ObjectPath::new(msg.path()?).ok()?;
        let member = msg.member()?.to_string();
        Some(Self {
            serial: msg.serial,
            flags: msg.flags,
            sender: msg.sender().map(str::to_string),
            interface: msg.interface().map(str::to_string),
            path,
            member,
            body: msg.body,
        })
    }

    /// Serial of the call, used as the reply serial of the answer.
    #[inline]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Unique name of the caller, if the bus filled it in.
    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn path(&self) -> &ObjectPath {
        &self.path
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Positional argument `index` of the body.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.body.get(index)
    }

    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// Whether the caller wants an answer.
    pub fn expects_reply(&self) -> bool {
        !flags::has_flag(self.flags, flags::NO_REPLY_EXPECTED)
    }
}
