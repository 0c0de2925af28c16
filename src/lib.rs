//! # busline
//!
//! Async client connection for D-Bus style message buses.
//!
//! One [`Connection`] multiplexes concurrent method calls, inbound calls to
//! exported objects and signals over a single unix socket.
//!
//! ## Architecture
//!
//! - **Serial allocator**: one task hands out unique non-zero serials
//! - **Writer task**: the only writer of the socket, strict submission order
//! - **Read loop**: the only reader; routes replies to waiters, signals to
//!   sinks and calls to handler tasks
//!
//! ## Example
//!
//! ```ignore
//! use busline::Connection;
//!
//! #[tokio::main]
//! async fn main() -> busline::Result<()> {
//!     let conn = Connection::session().await?;
//!     println!("connected as {:?}", conn.unique_name());
//!
//!     conn.add_match("type='signal'").await?;
//!     let mut signals = conn.signals(16);
//!     while let Some(signal) = signals.recv().await {
//!         println!("{}.{}", signal.interface, signal.name);
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod serial;
pub mod transport;

mod connection;
mod dispatch;
mod writer;

pub use connection::{
    bus_call, name_flags, Connection, ConnectionBuilder, ConnectionConfig, ReleaseNameReply,
    RequestNameReply, BUS_INTERFACE, BUS_NAME, BUS_PATH, DEFAULT_MAX_CONCURRENT_HANDLERS,
};
pub use dispatch::Signal;
pub use error::{BusError, MethodError, Result};
pub use handler::MethodCall;
pub use protocol::{Message, MessageType, ObjectPath, Signature, Value};
pub use registry::{PendingReply, Reply};
pub use writer::DEFAULT_CHANNEL_CAPACITY;
