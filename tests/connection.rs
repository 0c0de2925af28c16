//! Integration tests for busline.
//!
//! These tests run a real [`Connection`] against an in-memory fake bus that
//! speaks the handshake and the wire format over a duplex pipe.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use busline::handler::{error_names, MethodCall, PEER_INTERFACE};
use busline::protocol::{
    flags, FrameReader, HeaderField, Message, MessageType, ObjectPath, Signature, Value,
};
use busline::{
    bus_call, name_flags, BusError, Connection, ConnectionBuilder, ReleaseNameReply,
    RequestNameReply,
};
use tokio::io::{
    duplex, split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf,
    ReadHalf, WriteHalf,
};
use tokio::sync::Notify;

const UNIQUE_NAME: &str = ":1.42";
const GUID: &str = "0123456789abcdef0123456789abcdef";
const IFACE: &str = "org.example.Test";

/// Bus side of the pipe.
struct FakeBus {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    next_serial: u32,
}

impl FakeBus {
    /// Complete the handshake and answer `Hello`.
    async fn accept(mut stream: DuplexStream) -> Self {
        let auth = read_line(&mut stream).await;
        assert!(
            auth.starts_with("\0AUTH EXTERNAL "),
            "unexpected auth line {:?}",
            auth
        );
        stream
            .write_all(format!("OK {}\r\n", GUID).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_line(&mut stream).await, "BEGIN");

        let (reader, writer) = split(stream);
        let mut bus = FakeBus {
            reader: FrameReader::new(reader),
            writer,
            next_serial: 1,
        };
        let hello = bus.recv().await;
        assert_eq!(hello.member(), Some("Hello"));
        assert_eq!(hello.destination(), Some("org.freedesktop.DBus"));
        bus.reply(&hello, vec![Value::from(UNIQUE_NAME)]).await;
        bus
    }

    async fn recv(&mut self) -> Message {
        self.reader.read_message().await.unwrap()
    }

    async fn send(&mut self, mut msg: Message) -> u32 {
        msg.serial = self.next_serial;
        self.next_serial += 1;
        msg.headers
            .entry(HeaderField::Sender)
            .or_insert_with(|| Value::from("org.freedesktop.DBus"));
        self.writer.write_all(&msg.encode().unwrap()).await.unwrap();
        msg.serial
    }

    async fn reply(&mut self, call: &Message, body: Vec<Value>) {
        self.send(Message::method_return(call.serial, Some(UNIQUE_NAME)).with_body(body))
            .await;
    }

    /// Send a call to us from `:1.7`.
    async fn call_us(&mut self, path: &str, iface: &str, member: &str, body: Vec<Value>) -> u32 {
        let mut msg = Message::method_call(ObjectPath::new(path).unwrap(), member)
            .with_interface(iface)
            .with_destination(UNIQUE_NAME)
            .with_body(body);
        msg.headers.insert(HeaderField::Sender, Value::from(":1.7"));
        self.send(msg).await
    }
}

async fn read_line(stream: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    while !line.ends_with(b"\r\n") {
        line.push(stream.read_u8().await.unwrap());
    }
    line.truncate(line.len() - 2);
    String::from_utf8(line).unwrap()
}

async fn connect(builder: ConnectionBuilder) -> (Connection, FakeBus) {
    let (client, server) = duplex(64 * 1024);
    let bus = tokio::spawn(FakeBus::accept(server));
    let conn = builder.with_stream(client).await.unwrap();
    (conn, bus.await.unwrap())
}

/// Client end of the pipe whose writes start failing once `broken` is set.
struct BreakableStream {
    inner: DuplexStream,
    broken: Arc<AtomicBool>,
}

impl AsyncRead for BreakableStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BreakableStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn call(member: &str) -> Message {
    Message::method_call(ObjectPath::new("/org/example").unwrap(), member)
        .with_interface(IFACE)
        .with_destination("org.example.Service")
}

fn signal(member: &str, destination: Option<&str>) -> Message {
    let msg = Message::signal(ObjectPath::new("/org/example").unwrap(), IFACE, member)
        .with_body(vec![Value::from(member)]);
    match destination {
        Some(dest) => msg.with_destination(dest),
        None => msg,
    }
}

#[tokio::test]
async fn test_hello_assigns_unique_name() {
    let (conn, _bus) = connect(Connection::builder()).await;

    assert_eq!(conn.unique_name().as_deref(), Some(UNIQUE_NAME));
    assert_eq!(conn.names(), vec![UNIQUE_NAME.to_string()]);
    assert!(conn.is_local_name(UNIQUE_NAME));
    assert!(!conn.is_local_name(":1.43"));
    assert_eq!(conn.server_guid(), GUID);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_concurrent_calls_paired_out_of_order() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let a = conn.send(call("A")).await.unwrap().unwrap();
    let b = conn.send(call("B")).await.unwrap().unwrap();
    assert_ne!(a.serial(), b.serial());
    assert_ne!(a.serial(), 0);

    let first = bus.recv().await;
    let second = bus.recv().await;
    assert_eq!(first.member(), Some("A"));
    assert_eq!(second.member(), Some("B"));
    assert_eq!(first.serial, a.serial());

    bus.reply(&second, vec![Value::from("b")]).await;
    bus.reply(&first, vec![Value::from("a")]).await;

    assert_eq!(b.await.unwrap(), vec![Value::from("b")]);
    assert_eq!(a.await.unwrap(), vec![Value::from("a")]);
}

#[tokio::test]
async fn test_many_concurrent_callers() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let mut tasks = Vec::new();
    for i in 0..20u32 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let reply = conn
                .call(call("Double").with_body(vec![Value::from(i)]))
                .await
                .unwrap();
            (i, reply)
        }));
    }

    let mut calls = Vec::new();
    for _ in 0..20 {
        calls.push(bus.recv().await);
    }
    for msg in calls.iter().rev() {
        let n = msg.body[0].as_u32().unwrap();
        bus.reply(msg, vec![Value::from(n * 2)]).await;
    }

    for task in tasks {
        let (i, reply) = task.await.unwrap();
        assert_eq!(reply, vec![Value::from(i * 2)]);
    }
}

#[tokio::test]
async fn test_error_reply_surfaces_method_error() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let pending = conn.send(call("Broken")).await.unwrap().unwrap();
    let msg = bus.recv().await;
    let err = Message::error(
        msg.serial,
        Some(UNIQUE_NAME),
        &busline::MethodError::new("org.example.Error.Broken", "it broke"),
    );
    bus.send(err).await;

    match pending.await {
        Err(BusError::Method(e)) => {
            assert_eq!(e.name, "org.example.Error.Broken");
            assert_eq!(e.message(), Some("it broke"));
        }
        other => panic!("expected method error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_reply_call_returns_none() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let pending = conn
        .send(call("Fire").with_flags(flags::NO_REPLY_EXPECTED))
        .await
        .unwrap();
    assert!(pending.is_none());

    let msg = bus.recv().await;
    assert_eq!(msg.member(), Some("Fire"));
    assert!(!msg.expects_reply());
}

#[tokio::test]
async fn test_signal_emission() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    conn.emit(
        ObjectPath::new("/org/example").unwrap(),
        IFACE,
        "Changed",
        vec![Value::from(3u32)],
    )
    .await
    .unwrap();

    let msg = bus.recv().await;
    assert_eq!(msg.kind, MessageType::Signal);
    assert_eq!(msg.interface(), Some(IFACE));
    assert_eq!(msg.member(), Some("Changed"));
    assert_eq!(msg.body, vec![Value::from(3u32)]);
}

#[tokio::test]
async fn test_invalid_message_rejected_before_sending() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let mut invalid = call("Nope");
    invalid.headers.remove(&HeaderField::Member);
    assert!(matches!(
        conn.send(invalid).await,
        Err(BusError::Validation(_))
    ));

    // Nothing was written for it.
    conn.send(call("After").with_flags(flags::NO_REPLY_EXPECTED))
        .await
        .unwrap();
    assert_eq!(bus.recv().await.member(), Some("After"));
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_transport_failure_fails_pending_calls() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let first = conn.send(call("Hang")).await.unwrap().unwrap();
    let second = conn.send(call("Hang")).await.unwrap().unwrap();
    bus.recv().await;
    bus.recv().await;
    drop(bus);

    assert!(matches!(first.await, Err(BusError::Disconnected(_))));
    assert!(matches!(second.await, Err(BusError::Disconnected(_))));

    conn.wait_for_shutdown().await;
    assert!(conn.is_closed());
    assert!(matches!(
        conn.send(call("Late")).await,
        Err(BusError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_write_failure_disconnects_pending_calls() {
    let (client, server) = duplex(64 * 1024);
    let broken = Arc::new(AtomicBool::new(false));
    let stream = BreakableStream {
        inner: client,
        broken: broken.clone(),
    };
    let bus = tokio::spawn(FakeBus::accept(server));
    let conn = Connection::builder().with_stream(stream).await.unwrap();
    let mut bus = bus.await.unwrap();

    let waiting = conn.send(call("Hang")).await.unwrap().unwrap();
    bus.recv().await;

    broken.store(true, Ordering::SeqCst);
    let failing = conn.send(call("Fails")).await.unwrap().unwrap();

    match failing.await {
        Err(BusError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
        other => panic!("expected write error, got {:?}", other),
    }
    match waiting.await {
        Err(BusError::Disconnected(reason)) => assert!(reason.contains("write failed"), "{}", reason),
        other => panic!("expected disconnect, got {:?}", other),
    }

    tokio::time::timeout(Duration::from_secs(5), conn.wait_for_shutdown())
        .await
        .unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (conn, mut bus) = connect(Connection::builder()).await;
    let mut signals = conn.signals(4);

    let pending = conn.send(call("Hang")).await.unwrap().unwrap();
    bus.recv().await;

    conn.close();
    conn.close();

    assert!(matches!(pending.await, Err(BusError::ConnectionClosed)));
    assert!(conn.is_closed());
    assert_eq!(signals.recv().await, None);
    assert!(matches!(
        conn.call(call("Late")).await,
        Err(BusError::ConnectionClosed)
    ));

    tokio::time::timeout(Duration::from_secs(5), conn.wait_for_shutdown())
        .await
        .unwrap();

    // The writer shut its half down.
    assert!(bus.reader.read_message().await.is_err());
}

#[tokio::test]
async fn test_dropping_last_handle_closes() {
    let (conn, mut bus) = connect(Connection::builder()).await;
    let clone = conn.clone();
    drop(conn);
    assert!(!clone.is_closed());
    drop(clone);

    assert!(bus.reader.read_message().await.is_err());
}

#[tokio::test]
async fn test_signals_routed_to_signal_sink() {
    let (conn, mut bus) = connect(Connection::builder()).await;
    let mut signals = conn.signals(8);

    bus.send(signal("Broadcast", None)).await;
    bus.send(signal("Direct", Some(UNIQUE_NAME))).await;
    // Not ours, but with no eavesdrop sink signals still fall through.
    bus.send(signal("Foreign", Some(":1.99"))).await;

    for name in ["Broadcast", "Direct", "Foreign"] {
        let sig = signals.recv().await.unwrap();
        assert_eq!(sig.name, name);
        assert_eq!(sig.interface, IFACE);
        assert_eq!(sig.path.as_str(), "/org/example");
        assert_eq!(sig.sender.as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(sig.body, vec![Value::from(name)]);
    }
}

#[tokio::test]
async fn test_eavesdrop_takes_priority_over_signal_sink() {
    let (conn, mut bus) = connect(Connection::builder()).await;
    let mut signals = conn.signals(8);
    let mut eavesdropped = conn.eavesdrop(8);

    bus.send(signal("Direct", Some(UNIQUE_NAME))).await;
    bus.send(signal("Broadcast", None)).await;

    let msg = eavesdropped.recv().await.unwrap();
    assert_eq!(msg.member(), Some("Direct"));
    let msg = eavesdropped.recv().await.unwrap();
    assert_eq!(msg.member(), Some("Broadcast"));
    assert!(signals.try_recv().is_err());

    // Removing the eavesdrop sink restores normal signal delivery.
    conn.set_eavesdrop_sink(None);
    assert_eq!(eavesdropped.recv().await, None);
    bus.send(signal("Again", None)).await;
    assert_eq!(signals.recv().await.unwrap().name, "Again");
}

#[tokio::test]
async fn test_foreign_messages_are_eavesdropped() {
    let (conn, mut bus) = connect(Connection::builder()).await;
    let mut eavesdropped = conn.eavesdrop(8);

    let mut foreign = Message::method_call(ObjectPath::new("/x").unwrap(), "Poke")
        .with_interface(IFACE)
        .with_destination(":1.99");
    foreign.headers.insert(HeaderField::Sender, Value::from(":1.7"));
    let serial = bus.send(foreign).await;

    let msg = eavesdropped.recv().await.unwrap();
    assert_eq!(msg.serial, serial);
    assert_eq!(msg.destination(), Some(":1.99"));

    // It was not treated as a call to us: the next reply the bus sees is
    // for the ping.
    let ping = bus.call_us("/", PEER_INTERFACE, "Ping", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(ping));
}

#[tokio::test]
async fn test_foreign_call_without_eavesdrop_is_dropped() {
    let path = ObjectPath::new("/x").unwrap();
    let builder = Connection::builder().export(path, IFACE, "Poke", |_call: MethodCall| async {
        Ok(vec![Value::from("handled")])
    });
    let (_conn, mut bus) = connect(builder).await;

    let mut foreign = Message::method_call(ObjectPath::new("/x").unwrap(), "Poke")
        .with_interface(IFACE)
        .with_destination(":1.99");
    foreign.headers.insert(HeaderField::Sender, Value::from(":1.7"));
    bus.send(foreign).await;

    // Had the call been handled, its reply would arrive before the ping's.
    let ping = bus.call_us("/", PEER_INTERFACE, "Ping", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(ping));
    assert!(reply.body.is_empty());
}

#[tokio::test]
async fn test_dictionary_reply_resolves_call() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let pending = conn.send(call("GetAll")).await.unwrap().unwrap();
    let msg = bus.recv().await;

    let props = Value::array(
        Signature::element("{sv}").unwrap(),
        vec![
            Value::DictEntry(
                Box::new("Name".into()),
                Box::new(Value::variant("busline".into())),
            ),
            Value::DictEntry(
                Box::new("Count".into()),
                Box::new(Value::variant(Value::Byte(5))),
            ),
        ],
    );
    bus.reply(&msg, vec![props.clone()]).await;

    let body = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(body, vec![props]);
    assert_eq!(body[0].signature(), "a{sv}");
}

#[tokio::test]
async fn test_foreign_reply_does_not_resolve_our_call() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let pending = conn.send(call("Mine")).await.unwrap().unwrap();
    let msg = bus.recv().await;

    // Same reply serial, wrong destination: dropped.
    bus.send(
        Message::method_return(msg.serial, Some(":1.99")).with_body(vec![Value::from("theirs")]),
    )
    .await;
    bus.reply(&msg, vec![Value::from("ours")]).await;

    assert_eq!(pending.await.unwrap(), vec![Value::from("ours")]);
}

#[tokio::test]
async fn test_inbound_call_answered() {
    let path = ObjectPath::new("/org/example/Echo").unwrap();
    let builder = Connection::builder().export(path, IFACE, "Echo", |call: MethodCall| async move {
        assert_eq!(call.sender(), Some(":1.7"));
        assert_eq!(call.arg(0), Some(&Value::from("hi")));
        assert_eq!(call.arg(1), None);
        Ok(call.into_body())
    });
    let (_conn, mut bus) = connect(builder).await;

    let serial = bus
        .call_us("/org/example/Echo", IFACE, "Echo", vec![Value::from("hi")])
        .await;
    let reply = bus.recv().await;

    assert_eq!(reply.kind, MessageType::MethodReturn);
    assert_eq!(reply.reply_serial(), Some(serial));
    assert_eq!(reply.destination(), Some(":1.7"));
    assert_eq!(reply.body, vec![Value::from("hi")]);
}

#[tokio::test]
async fn test_export_after_connect() {
    let (conn, mut bus) = connect(Connection::builder()).await;
    let path = ObjectPath::new("/late").unwrap();
    assert!(!conn.export(path.clone(), IFACE, "Get", |_call: MethodCall| async {
        Ok(vec![Value::from(true)])
    }));

    let serial = bus.call_us("/late", IFACE, "Get", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(serial));
    assert_eq!(reply.body, vec![Value::from(true)]);

    assert!(conn.unexport(&path, IFACE, "Get"));
    let serial = bus.call_us("/late", IFACE, "Get", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(serial));
    assert_eq!(reply.error_name(), Some(error_names::UNKNOWN_OBJECT));
}

#[tokio::test]
async fn test_unknown_method_error_reply() {
    let path = ObjectPath::new("/svc").unwrap();
    let builder = Connection::builder().export(path, IFACE, "Known", |_call: MethodCall| async {
        Ok(Vec::new())
    });
    let (_conn, mut bus) = connect(builder).await;

    let serial = bus.call_us("/svc", IFACE, "Unknown", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.reply_serial(), Some(serial));
    assert_eq!(reply.error_name(), Some(error_names::UNKNOWN_METHOD));

    let serial = bus.call_us("/elsewhere", IFACE, "Known", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(serial));
    assert_eq!(reply.error_name(), Some(error_names::UNKNOWN_OBJECT));
}

#[tokio::test]
async fn test_handler_error_becomes_error_reply() {
    let path = ObjectPath::new("/svc").unwrap();
    let builder = Connection::builder().export(path, IFACE, "Fail", |_call: MethodCall| async {
        Err(busline::MethodError::new("org.example.Error.Nope", "nope"))
    });
    let (_conn, mut bus) = connect(builder).await;

    bus.call_us("/svc", IFACE, "Fail", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.error_name(), Some("org.example.Error.Nope"));
    assert_eq!(reply.body, vec![Value::from("nope")]);
}

#[tokio::test]
async fn test_no_reply_inbound_call_is_not_answered() {
    let path = ObjectPath::new("/svc").unwrap();
    let builder = Connection::builder().export(path, IFACE, "Poke", |_call: MethodCall| async {
        Ok(vec![Value::from(1u32)])
    });
    let (_conn, mut bus) = connect(builder).await;

    let mut poke = Message::method_call(ObjectPath::new("/svc").unwrap(), "Poke")
        .with_interface(IFACE)
        .with_destination(UNIQUE_NAME)
        .with_flags(flags::NO_REPLY_EXPECTED);
    poke.headers.insert(HeaderField::Sender, Value::from(":1.7"));
    bus.send(poke).await;

    // Give the handler time to run before the ping.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let ping = bus.call_us("/", PEER_INTERFACE, "Ping", Vec::new()).await;
    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(ping));
    assert!(reply.body.is_empty());
}

#[tokio::test]
async fn test_handler_limit_refuses_excess_calls() {
    let gate = Arc::new(Notify::new());
    let handler_gate = gate.clone();
    let path = ObjectPath::new("/svc").unwrap();
    let builder = Connection::builder()
        .max_concurrent_handlers(1)
        .export(path, IFACE, "Slow", move |call: MethodCall| {
            let gate = handler_gate.clone();
            async move {
                gate.notified().await;
                Ok(call.into_body())
            }
        });
    let (_conn, mut bus) = connect(builder).await;

    let slow = bus
        .call_us("/svc", IFACE, "Slow", vec![Value::from(1u32)])
        .await;
    let refused = bus
        .call_us("/svc", IFACE, "Slow", vec![Value::from(2u32)])
        .await;

    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(refused));
    assert_eq!(reply.error_name(), Some(error_names::LIMITS_EXCEEDED));

    gate.notify_one();
    let reply = bus.recv().await;
    assert_eq!(reply.reply_serial(), Some(slow));
    assert_eq!(reply.body, vec![Value::from(1u32)]);
}

#[tokio::test]
async fn test_unreadable_frame_is_skipped() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let pending = conn.send(call("Survive")).await.unwrap().unwrap();
    let msg = bus.recv().await;

    // Bad byte-order tag: only the 16-byte prefix is consumed.
    bus.writer.write_all(&[b'X'; 16]).await.unwrap();
    bus.reply(&msg, vec![Value::from("still here")]).await;

    assert_eq!(pending.await.unwrap(), vec![Value::from("still here")]);
    assert!(!conn.is_closed());
}

#[tokio::test]
async fn test_oversized_frame_is_fatal() {
    let (conn, mut bus) = connect(Connection::builder().max_message_size(256)).await;

    let pending = conn.send(call("Big")).await.unwrap().unwrap();
    let msg = bus.recv().await;
    bus.reply(&msg, vec![Value::from("x".repeat(1024))]).await;

    assert!(matches!(pending.await, Err(BusError::Disconnected(_))));
    conn.wait_for_shutdown().await;
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_request_name_adds_name() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let request = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.request_name("org.example.Service", name_flags::DO_NOT_QUEUE)
                .await
        })
    };

    let msg = bus.recv().await;
    assert_eq!(msg.member(), Some("RequestName"));
    assert_eq!(
        msg.body,
        vec![
            Value::from("org.example.Service"),
            Value::from(name_flags::DO_NOT_QUEUE)
        ]
    );
    bus.reply(&msg, vec![Value::from(1u32)]).await;

    assert_eq!(
        request.await.unwrap().unwrap(),
        RequestNameReply::PrimaryOwner
    );
    assert!(conn.is_local_name("org.example.Service"));
    assert_eq!(conn.names().len(), 2);

    // Calls to the well-known name are now ours too.
    let mut ping = Message::method_call(ObjectPath::root(), "Ping")
        .with_interface(PEER_INTERFACE)
        .with_destination("org.example.Service");
    ping.headers.insert(HeaderField::Sender, Value::from(":1.7"));
    let serial = bus.send(ping).await;
    assert_eq!(bus.recv().await.reply_serial(), Some(serial));
}

#[tokio::test]
async fn test_request_name_in_queue_does_not_add_name() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let request = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.request_name("org.example.Queued", 0).await })
    };
    let msg = bus.recv().await;
    bus.reply(&msg, vec![Value::from(2u32)]).await;

    assert_eq!(request.await.unwrap().unwrap(), RequestNameReply::InQueue);
    assert!(!conn.is_local_name("org.example.Queued"));
}

#[tokio::test]
async fn test_release_name_removes_name() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let request = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.request_name("org.example.Gone", 0).await })
    };
    let msg = bus.recv().await;
    bus.reply(&msg, vec![Value::from(1u32)]).await;
    request.await.unwrap().unwrap();
    assert!(conn.is_local_name("org.example.Gone"));

    let release = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.release_name("org.example.Gone").await })
    };
    let msg = bus.recv().await;
    assert_eq!(msg.member(), Some("ReleaseName"));
    assert_eq!(msg.body, vec![Value::from("org.example.Gone")]);
    bus.reply(&msg, vec![Value::from(1u32)]).await;

    assert_eq!(release.await.unwrap().unwrap(), ReleaseNameReply::Released);
    assert!(!conn.is_local_name("org.example.Gone"));
    assert_eq!(conn.names(), vec![UNIQUE_NAME.to_string()]);

    // The unique name stays even if the bus claims it was released.
    let release = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.release_name(UNIQUE_NAME).await })
    };
    let msg = bus.recv().await;
    bus.reply(&msg, vec![Value::from(1u32)]).await;
    release.await.unwrap().unwrap();
    assert_eq!(conn.unique_name().as_deref(), Some(UNIQUE_NAME));
}

#[tokio::test]
async fn test_add_match_calls_bus() {
    let (conn, mut bus) = connect(Connection::builder()).await;

    let task = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.add_match("type='signal'").await })
    };
    let msg = bus.recv().await;
    assert_eq!(msg.member(), Some("AddMatch"));
    assert_eq!(msg.interface(), Some("org.freedesktop.DBus"));
    assert_eq!(msg.body, vec![Value::from("type='signal'")]);
    bus.reply(&msg, Vec::new()).await;
    task.await.unwrap().unwrap();

    // bus_call builds the same shape for arbitrary bus methods.
    let direct = bus_call("RemoveMatch", vec![Value::from("type='signal'")]);
    assert_eq!(direct.destination(), msg.destination());
    assert_eq!(direct.path(), msg.path());
}
