//! Handler module - exported objects and inbound call dispatch.
//!
//! Provides:
//! - [`ExportTable`] - maps `(path, interface, member)` to handlers
//! - [`MethodCall`] - what a handler receives
//! - [`CallHandler`] / [`FnHandler`] - the handler trait and closure adapter
//!
//! # Example
//!
//! ```ignore
//! use busline::Connection;
//!
//! let conn = Connection::builder()
//!     .export(path, "org.example.Echo", "Echo", |call: MethodCall| async move {
//!         Ok(call.into_body())
//!     })
//!     .session()
//!     .await?;
//! ```

mod context;
mod registry;

pub use context::MethodCall;
pub use registry::{BoxFuture, CallHandler, ExportTable, FnHandler, HandlerResult, Lookup};

/// Interface answered automatically for every object.
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";

/// Error names used in replies to inbound calls.
pub mod error_names {
    pub const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
    pub const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
    pub const LIMITS_EXCEEDED: &str = "org.freedesktop.DBus.Error.LimitsExceeded";
    pub const FAILED: &str = "org.freedesktop.DBus.Error.Failed";
}
