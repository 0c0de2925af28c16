//! Connection builder and facade.
//!
//! The [`ConnectionBuilder`] configures limits, authentication and exported
//! objects, then connects. A [`Connection`] manages the lifecycle:
//! 1. Open the socket and authenticate
//! 2. Spawn the serial allocator, the writer task and the read loop
//! 3. Call `Hello` to obtain the unique name
//! 4. Serve calls and signals until closed or the transport fails
//!
//! # Example
//!
//! ```ignore
//! use busline::{Connection, Message, ObjectPath};
//!
//! #[tokio::main]
//! async fn main() -> busline::Result<()> {
//!     let conn = Connection::session().await?;
//!     let names = conn
//!         .call(
//!             Message::method_call(ObjectPath::new("/org/freedesktop/DBus")?, "ListNames")
//!                 .with_interface("org.freedesktop.DBus")
//!                 .with_destination("org.freedesktop.DBus"),
//!         )
//!         .await?;
//!     println!("{:?}", names);
//!     conn.close();
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, ExternalAuth};
use crate::dispatch::{self, Signal};
use crate::error::{BusError, Result};
use crate::handler::{ExportTable, FnHandler, HandlerResult, MethodCall};
use crate::protocol::{FrameReader, Message, ObjectPath, Value, MAX_MESSAGE_SIZE};
use crate::registry::{PendingReply, ReplyRegistry, SinkSlot};
use crate::serial::{spawn_serial_allocator, SerialAllocator};
use crate::transport::{self, session_bus_address, system_bus_address, BusAddress};
use crate::writer::{
    spawn_writer_task, TransportFailure, WriterConfig, WriterContext, WriterHandle,
    DEFAULT_CHANNEL_CAPACITY,
};

/// Well-known name of the bus itself.
pub const BUS_NAME: &str = "org.freedesktop.DBus";
/// Object path of the bus object.
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
/// Interface of the bus object.
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Default maximum concurrent inbound call handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Flags for [`Connection::request_name`].
pub mod name_flags {
    pub const ALLOW_REPLACEMENT: u32 = 0x1;
    pub const REPLACE_EXISTING: u32 = 0x2;
    pub const DO_NOT_QUEUE: u32 = 0x4;
}

/// Answer to a `RequestName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner = 1,
    InQueue = 2,
    Exists = 3,
    AlreadyOwner = 4,
}

impl RequestNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::PrimaryOwner),
            2 => Some(Self::InQueue),
            3 => Some(Self::Exists),
            4 => Some(Self::AlreadyOwner),
            _ => None,
        }
    }

    /// Whether we own the name after this reply.
    pub fn is_owner(self) -> bool {
        matches!(self, Self::PrimaryOwner | Self::AlreadyOwner)
    }
}

/// Answer to a `ReleaseName` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released = 1,
    NonExistent = 2,
    NotOwner = 3,
}

impl ReleaseNameReply {
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Released),
            2 => Some(Self::NonExistent),
            3 => Some(Self::NotOwner),
            _ => None,
        }
    }
}

/// Tunable limits of a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of the outbound message queue.
    pub channel_capacity: usize,
    /// Inbound calls handled at once; extra calls are refused.
    pub max_concurrent_handlers: usize,
    /// Largest inbound frame accepted.
    pub max_message_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Builder for configuring and opening a [`Connection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    auth: Box<dyn Authenticator>,
    exports: ExportTable,
}

impl ConnectionBuilder {
    /// Create a new connection builder.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            auth: Box::new(ExternalAuth::new()),
            exports: ExportTable::new(),
        }
    }

    /// Set the outbound queue capacity.
    ///
    /// Default: 10
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Set the maximum number of concurrent inbound call handlers.
    ///
    /// Calls beyond this limit are answered with `LimitsExceeded`.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the largest inbound message accepted.
    ///
    /// Default: 128 MiB
    pub fn max_message_size(mut self, size: u32) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Use a different authentication mechanism. Default: `EXTERNAL`.
    pub fn authenticator<A: Authenticator + 'static>(mut self, auth: A) -> Self {
        self.auth = Box::new(auth);
        self
    }

    /// Export a method before connecting, so it is served from the first
    /// inbound message.
    pub fn export<F, Fut>(self, path: ObjectPath, interface: &str, member: &str, handler: F) -> Self
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.exports
            .export(path, interface, member, FnHandler::new(handler));
        self
    }

    /// Connect to the session bus.
    pub async fn session(self) -> Result<Connection> {
        let address = session_bus_address().await?;
        self.connect(&address).await
    }

    /// Connect to the system bus.
    pub async fn system(self) -> Result<Connection> {
        self.connect(&system_bus_address()).await
    }

    /// Connect to the bus at `address`.
    pub async fn connect(self, address: &str) -> Result<Connection> {
        let address = BusAddress::parse(address)?;
        let mut stream = transport::connect(&address).await?;
        let guid = self.auth.authenticate(&mut stream).await?;
        if let Some(expected) = &address.guid {
            if *expected != guid {
                return Err(BusError::Auth(format!(
                    "server guid {} does not match address guid {}",
                    guid, expected
                )));
            }
        }
        let (reader, writer) = stream.into_split();
        Connection::start(reader, writer, guid, self.config, self.exports).await
    }

    /// Run the connection over an already open stream.
    pub async fn with_stream<S>(self, mut stream: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let guid = self.auth.authenticate(&mut stream).await?;
        let (reader, writer) = tokio::io::split(stream);
        Connection::start(reader, writer, guid, self.config, self.exports).await
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by the facade, the read loop and handler tasks.
pub(crate) struct Shared {
    names: RwLock<Vec<String>>,
    guid: String,
    pub(crate) replies: Arc<ReplyRegistry>,
    pub(crate) serials: SerialAllocator,
    writer: WriterHandle,
    pub(crate) signals: SinkSlot<Signal>,
    pub(crate) eavesdrop: SinkSlot<Message>,
    pub(crate) exports: ExportTable,
    pub(crate) handler_limit: Arc<Semaphore>,
    /// Cancelled when teardown starts, or by the writer when the
    /// transport fails.
    pub(crate) shutdown: CancellationToken,
    failure: TransportFailure,
    /// Cancelled once the read loop has exited.
    pub(crate) finished: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    /// Whether a message with this destination is for us. Before `Hello`
    /// completes no names are known and everything is.
    pub(crate) fn is_addressed_here(&self, destination: Option<&str>) -> bool {
        let names = self.names.read();
        if names.is_empty() {
            return true;
        }
        destination.is_some_and(|d| names.iter().any(|n| n == d))
    }

    /// Why `shutdown` was cancelled: a recorded transport failure, or a
    /// local close.
    pub(crate) fn shutdown_cause(&self) -> BusError {
        match self.failure.lock().as_ref() {
            Some(reason) => BusError::Disconnected(reason.clone()),
            None => BusError::ConnectionClosed,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Validate, number and queue a message.
    pub(crate) async fn send(&self, mut msg: Message) -> Result<Option<PendingReply>> {
        msg.validate()?;
        if self.is_closed() {
            return Err(BusError::ConnectionClosed);
        }

        let serial = self.serials.allocate().await?;
        msg.serial = serial;
        let expects_reply = msg.expects_reply();
        let pending = if expects_reply {
            match self.replies.register(serial) {
                Ok(pending) => Some(pending),
                Err(e) => {
                    self.serials.release(serial);
                    return Err(e);
                }
            }
        } else {
            None
        };

        if self.writer.send(msg).await.is_err() {
            // Writer is gone. Close out the serial unless teardown already
            // did.
            if !expects_reply {
                self.serials.release(serial);
            } else if let Some(waiter) = self.replies.take(serial) {
                self.serials.release(serial);
                let _ = waiter.send(Err(BusError::ConnectionClosed));
            }
            return Err(BusError::ConnectionClosed);
        }
        Ok(pending)
    }

    /// Stop everything and fail all outstanding calls. Idempotent.
    pub(crate) fn teardown(&self, reason: &BusError) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Connection shutting down: {}", reason);
        }
        self.shutdown.cancel();
        self.signals.close();
        self.eavesdrop.close();

        for (serial, waiter) in self.replies.drain() {
            self.serials.release(serial);
            let failure = match reason {
                BusError::ConnectionClosed => BusError::ConnectionClosed,
                BusError::Disconnected(why) => BusError::Disconnected(why.clone()),
                other => BusError::Disconnected(other.to_string()),
            };
            let _ = waiter.send(Err(failure));
        }
    }
}

/// Closes the connection when the last user handle goes away.
struct Handle {
    shared: Arc<Shared>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.teardown(&BusError::ConnectionClosed);
    }
}

/// A connection to a message bus.
///
/// Cheap to clone; all clones share one socket. The connection closes when
/// [`close`](Self::close) is called, when the transport fails, or when the
/// last clone is dropped.
#[derive(Clone)]
pub struct Connection {
    handle: Arc<Handle>,
}

impl Connection {
    /// Create a new connection builder.
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Connect to the session bus with default settings.
    pub async fn session() -> Result<Self> {
        ConnectionBuilder::new().session().await
    }

    /// Connect to the system bus with default settings.
    pub async fn system() -> Result<Self> {
        ConnectionBuilder::new().system().await
    }

    /// Start the workers over an authenticated stream and say `Hello`.
    async fn start<R, W>(
        reader: R,
        writer: W,
        guid: String,
        config: ConnectionConfig,
        exports: ExportTable,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (serials, _allocator_task) = spawn_serial_allocator();
        let replies = Arc::new(ReplyRegistry::new());
        let shutdown = CancellationToken::new();
        let failure = TransportFailure::default();

        let (writer, _writer_task) = spawn_writer_task(
            writer,
            WriterConfig {
                channel_capacity: config.channel_capacity,
            },
            WriterContext {
                replies: replies.clone(),
                serials: serials.clone(),
                shutdown: shutdown.clone(),
                failure: failure.clone(),
            },
        );

        let shared = Arc::new(Shared {
            names: RwLock::new(Vec::new()),
            guid,
            replies,
            serials,
            writer,
            signals: SinkSlot::new(),
            eavesdrop: SinkSlot::new(),
            exports,
            handler_limit: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            shutdown,
            failure,
            finished: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let reader = FrameReader::with_max_message_size(reader, config.max_message_size);
        tokio::spawn(dispatch::read_loop(reader, shared.clone()));

        let conn = Connection {
            handle: Arc::new(Handle { shared }),
        };
        // On failure, dropping `conn` tears everything down.
        conn.hello().await?;
        Ok(conn)
    }

    fn shared(&self) -> &Shared {
        &self.handle.shared
    }

    async fn hello(&self) -> Result<()> {
        let reply = self.call(bus_call("Hello", Vec::new())).await?;
        let name = reply
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| BusError::Protocol("Hello reply carried no name".into()))?;
        tracing::debug!("Registered on the bus as {}", name);
        *self.shared().names.write() = vec![name.to_string()];
        Ok(())
    }

    /// Send a message.
    ///
    /// Returns the pending reply for method calls that expect one, and
    /// `None` for everything else. Invalid messages and sends on a closed
    /// connection fail here without anything being written.
    pub async fn send(&self, msg: Message) -> Result<Option<PendingReply>> {
        self.shared().send(msg).await
    }

    /// Send a method call and wait for its reply body.
    ///
    /// Calls flagged `NO_REPLY_EXPECTED` return an empty body once queued.
    pub async fn call(&self, msg: Message) -> Result<Vec<Value>> {
        match self.send(msg).await? {
            Some(pending) => pending.await,
            None => Ok(Vec::new()),
        }
    }

    /// Emit a signal.
    pub async fn emit(
        &self,
        path: ObjectPath,
        interface: &str,
        member: &str,
        body: Vec<Value>,
    ) -> Result<()> {
        self.send(Message::signal(path, interface, member).with_body(body))
            .await?;
        Ok(())
    }

    /// Close the connection. Pending calls fail with
    /// [`BusError::ConnectionClosed`]. Safe to call more than once.
    pub fn close(&self) {
        self.shared().teardown(&BusError::ConnectionClosed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared().is_closed()
    }

    /// Wait until the read loop has stopped.
    pub async fn wait_for_shutdown(&self) {
        self.shared().finished.cancelled().await;
    }

    /// Names owned by this connection; the unique name comes first.
    pub fn names(&self) -> Vec<String> {
        self.shared().names.read().clone()
    }

    /// Unique name assigned by the bus.
    pub fn unique_name(&self) -> Option<String> {
        self.shared().names.read().first().cloned()
    }

    /// Whether `name` is one of our names.
    pub fn is_local_name(&self, name: &str) -> bool {
        self.shared().names.read().iter().any(|n| n == name)
    }

    /// GUID the server sent during authentication.
    pub fn server_guid(&self) -> &str {
        &self.shared().guid
    }

    /// Install a new signal sink with the given buffer size and return its
    /// receiving end. Any previous sink is dropped.
    pub fn signals(&self, capacity: usize) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.set_signal_sink(Some(tx));
        rx
    }

    /// Install or remove the signal sink.
    pub fn set_signal_sink(&self, sink: Option<mpsc::Sender<Signal>>) {
        self.shared().signals.replace(sink);
        if self.is_closed() {
            self.shared().signals.close();
        }
    }

    /// Install a new eavesdrop sink and return its receiving end.
    ///
    /// While installed it receives every message not addressed to us and
    /// every signal, instead of the signal sink.
    pub fn eavesdrop(&self, capacity: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.set_eavesdrop_sink(Some(tx));
        rx
    }

    /// Install or remove the eavesdrop sink.
    pub fn set_eavesdrop_sink(&self, sink: Option<mpsc::Sender<Message>>) {
        self.shared().eavesdrop.replace(sink);
        if self.is_closed() {
            self.shared().eavesdrop.close();
        }
    }

    /// Export a method on this connection.
    ///
    /// Returns `true` if an earlier handler was replaced.
    pub fn export<F, Fut>(&self, path: ObjectPath, interface: &str, member: &str, handler: F) -> bool
    where
        F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.shared()
            .exports
            .export(path, interface, member, FnHandler::new(handler))
    }

    /// Stop serving a method. Returns `false` if it was not exported.
    pub fn unexport(&self, path: &ObjectPath, interface: &str, member: &str) -> bool {
        self.shared().exports.unexport(path, interface, member)
    }

    /// Ask the bus for a well-known name.
    pub async fn request_name(&self, name: &str, flags: u32) -> Result<RequestNameReply> {
        let reply = self
            .call(bus_call(
                "RequestName",
                vec![Value::from(name), Value::from(flags)],
            ))
            .await?;
        let code = first_u32(&reply, "RequestName")?;
        let outcome = RequestNameReply::from_code(code).ok_or_else(|| {
            BusError::Protocol(format!("unknown RequestName reply {}", code))
        })?;

        if outcome.is_owner() {
            let mut names = self.shared().names.write();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        Ok(outcome)
    }

    /// Give up a well-known name.
    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply> {
        let reply = self
            .call(bus_call("ReleaseName", vec![Value::from(name)]))
            .await?;
        let code = first_u32(&reply, "ReleaseName")?;
        let outcome = ReleaseNameReply::from_code(code).ok_or_else(|| {
            BusError::Protocol(format!("unknown ReleaseName reply {}", code))
        })?;

        if outcome == ReleaseNameReply::Released {
            // The unique name is never released.
            let mut names = self.shared().names.write();
            if let Some(pos) = names.iter().skip(1).position(|n| n == name) {
                names.remove(pos + 1);
            }
        }
        Ok(outcome)
    }

    /// Subscribe to messages matching `rule`.
    pub async fn add_match(&self, rule: &str) -> Result<()> {
        self.call(bus_call("AddMatch", vec![Value::from(rule)]))
            .await?;
        Ok(())
    }

    /// Drop a subscription added with [`add_match`](Self::add_match).
    pub async fn remove_match(&self, rule: &str) -> Result<()> {
        self.call(bus_call("RemoveMatch", vec![Value::from(rule)]))
            .await?;
        Ok(())
    }
}

/// A method call on the bus object.
pub fn bus_call(member: &str, body: Vec<Value>) -> Message {
    Message::method_call(ObjectPath::from_static(BUS_PATH), member)
        .with_interface(BUS_INTERFACE)
        .with_destination(BUS_NAME)
        .with_body(body)
}

fn first_u32(reply: &[Value], method: &str) -> Result<u32> {
    reply
        .first()
        .and_then(Value::as_u32)
        .ok_or_else(|| BusError::Protocol(format!("{} reply carried no code", method)))
}
