//! Inbound dispatcher: the single reader of the transport.
//!
//! Every decoded message is routed exactly one way:
//!
//! ```text
//! not addressed to us ─────────────────► eavesdrop sink
//! method return / error ───────────────► reply waiter (by reply serial)
//! signal ──────────────────────────────► eavesdrop sink if installed,
//!                                        otherwise signal sink
//! method call ─────────────────────────► handler task (bounded)
//! ```
//!
//! Messages not addressed to us skip the eavesdrop sink only when they are
//! signals and no eavesdrop sink is installed; those fall through to normal
//! signal routing. Sink delivery never blocks the reader.

use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncRead;

use crate::connection::Shared;
use crate::error::{BusError, MethodError};
use crate::handler::{error_names, ExportTable, HandlerResult, Lookup, MethodCall, PEER_INTERFACE};
use crate::protocol::{FrameReader, Message, MessageType, ObjectPath, Value};
use crate::registry::Delivery;

/// Files consulted for `org.freedesktop.DBus.Peer.GetMachineId`.
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// A signal delivered to the signal sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Signal {
    /// Unique name of the emitter, if the bus filled it in.
    pub sender: Option<String>,
    pub path: ObjectPath,
    pub interface: String,
    /// Member name of the signal.
    pub name: String,
    pub body: Vec<Value>,
}

impl Signal {
    /// Extract a signal from a decoded message.
    pub fn from_message(msg: Message) -> Option<Self> {
        if msg.kind != MessageType::Signal {
            return None;
        }
        let path = ObjectPath::new(msg.path()?).ok()?;
        let interface = msg.interface()?.to_string();
        let name = msg.member()?.to_string();
        Some(Self {
            sender: msg.sender().map(str::to_string),
            path,
            interface,
            name,
            body: msg.body,
        })
    }
}

/// Main read loop - reads messages until the transport fails or the
/// connection is closed, then tears the connection down.
pub(crate) async fn read_loop<R>(mut reader: FrameReader<R>, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => Err(shared.shutdown_cause()),
            res = reader.read_message() => res,
        };

        match next {
            Ok(msg) => route(&shared, msg),
            Err(e) if !e.is_fatal() => {
                tracing::warn!("Dropping unreadable message: {}", e);
            }
            Err(e) => {
                if !matches!(e, BusError::ConnectionClosed) {
                    tracing::error!("Read loop error: {}", e);
                }
                shared.teardown(&e);
                break;
            }
        }
    }
    shared.finished.cancel();
}

/// Route one inbound message.
pub(crate) fn route(shared: &Arc<Shared>, msg: Message) {
    let addressed_here = shared.is_addressed_here(msg.destination());
    if !addressed_here && (msg.kind != MessageType::Signal || shared.eavesdrop.is_installed()) {
        eavesdrop(shared, msg);
        return;
    }

    match msg.kind {
        MessageType::MethodReturn | MessageType::Error => resolve_reply(shared, msg),
        MessageType::Signal => route_signal(shared, msg),
        MessageType::MethodCall => spawn_call(shared.clone(), msg),
    }
}

fn eavesdrop(shared: &Shared, msg: Message) {
    let serial = msg.serial;
    let outcome = shared.eavesdrop.try_deliver(msg);
    if outcome != Delivery::Delivered {
        tracing::debug!("Eavesdropped message {} dropped: {:?}", serial, outcome);
    }
}

fn resolve_reply(shared: &Shared, msg: Message) {
    let Some(reply_serial) = msg.reply_serial() else {
        tracing::debug!("Reply {} carries no reply serial", msg.serial);
        return;
    };
    let Some(waiter) = shared.replies.take(reply_serial) else {
        tracing::debug!("No caller waiting for reply to {}", reply_serial);
        return;
    };
    shared.serials.release(reply_serial);

    let reply = if msg.kind == MessageType::Error {
        let name = msg.error_name().unwrap_or(error_names::FAILED).to_string();
        Err(BusError::Method(MethodError {
            name,
            body: msg.body,
        }))
    } else {
        Ok(msg.body)
    };
    // The caller may have stopped waiting.
    let _ = waiter.send(reply);
}

fn route_signal(shared: &Shared, msg: Message) {
    if shared.eavesdrop.is_installed() {
        eavesdrop(shared, msg);
        return;
    }
    let serial = msg.serial;
    let Some(signal) = Signal::from_message(msg) else {
        tracing::debug!("Signal {} lacks a path or interface, dropped", serial);
        return;
    };
    let outcome = shared.signals.try_deliver(signal);
    if outcome != Delivery::Delivered {
        tracing::debug!("Signal {} dropped: {:?}", serial, outcome);
    }
}

/// Run an inbound call on its own task and send the answer.
///
/// Over the handler limit the call is refused with `LimitsExceeded` rather
/// than queued, so a flood of calls cannot stall the reader.
fn spawn_call(shared: Arc<Shared>, msg: Message) {
    let serial = msg.serial;
    let Some(call) = MethodCall::from_message(msg) else {
        tracing::debug!("Call {} lacks a path or member, dropped", serial);
        return;
    };
    let permit = shared.handler_limit.clone().try_acquire_owned();

    tokio::spawn(async move {
        let serial = call.serial();
        let sender = call.sender().map(str::to_string);
        let expects_reply = call.expects_reply();

        let result = match permit {
            Ok(permit) => {
                let result = invoke(&shared.exports, call).await;
                drop(permit);
                result
            }
            Err(_) => {
                tracing::warn!("Handler capacity reached, refusing call {}", serial);
                Err(MethodError::new(
                    error_names::LIMITS_EXCEEDED,
                    "too many concurrent calls",
                ))
            }
        };

        if !expects_reply {
            return;
        }
        let reply = match result {
            Ok(body) => Message::method_return(serial, sender.as_deref()).with_body(body),
            Err(e) => Message::error(serial, sender.as_deref(), &e),
        };
        if let Err(e) = shared.send(reply).await {
            tracing::debug!("Could not answer call {}: {}", serial, e);
        }
    });
}

/// Resolve and run the handler for a call.
pub(crate) async fn invoke(exports: &ExportTable, call: MethodCall) -> HandlerResult {
    if call.interface() == Some(PEER_INTERFACE) {
        return match call.member() {
            "Ping" => Ok(Vec::new()),
            "GetMachineId" => machine_id().await,
            other => Err(MethodError::new(
                error_names::UNKNOWN_METHOD,
                format!("no method {}.{}", PEER_INTERFACE, other),
            )),
        };
    }

    match exports.lookup(call.path(), call.interface(), call.member()) {
        Lookup::Found(handler) => {
            let member = call.member().to_string();
            // Own task, so a panicking handler still gets an error reply.
            match tokio::spawn(handler.call(call)).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Handler error for method {}: {}", member, e);
                    Err(MethodError::new(
                        error_names::FAILED,
                        format!("handler for {} failed", member),
                    ))
                }
            }
        }
        Lookup::UnknownObject => Err(MethodError::new(
            error_names::UNKNOWN_OBJECT,
            format!("no object at path {}", call.path()),
        )),
        Lookup::UnknownMethod => Err(MethodError::new(
            error_names::UNKNOWN_METHOD,
            format!(
                "no method {}.{} on {}",
                call.interface().unwrap_or("*"),
                call.member(),
                call.path()
            ),
        )),
    }
}

async fn machine_id() -> HandlerResult {
    for path in MACHINE_ID_PATHS {
        if let Ok(id) = tokio::fs::read_to_string(path).await {
            return Ok(vec![Value::from(id.trim())]);
        }
    }
    Err(MethodError::new(
        error_names::FAILED,
        "machine id is not available",
    ))
}
