//! Reply waiters and signal/eavesdrop sinks.
//!
//! The [`ReplyRegistry`] maps the serial of every outstanding call to the
//! one-shot channel its caller is waiting on. Whoever removes an entry owns
//! delivering the single [`Reply`] for it, so a waiter can never be answered
//! twice. Once drained at shutdown the registry refuses new waiters.
//!
//! A [`SinkSlot`] holds an optional consumer channel. Delivery never waits:
//! if the consumer is not keeping up, the item is dropped. Signal and
//! eavesdrop delivery is lossy.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BusError, Result};
use crate::protocol::Value;

/// Outcome of a call: the reply body, a remote error, or a local failure.
pub type Reply = Result<Vec<Value>>;

struct RegistryState {
    waiters: HashMap<u32, oneshot::Sender<Reply>>,
    closed: bool,
}

/// Serial to waiter mapping, guarded by a single lock.
pub struct ReplyRegistry {
    state: Mutex<RegistryState>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                waiters: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register a waiter for `serial`.
    ///
    /// Fails with [`BusError::ConnectionClosed`] after [`drain`](Self::drain).
    pub fn register(&self, serial: u32) -> Result<PendingReply> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BusError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        if state.waiters.insert(serial, tx).is_some() {
            tracing::error!("Serial {} registered twice", serial);
        }
        Ok(PendingReply { serial, rx })
    }

    /// Remove the waiter for `serial`, if still registered.
    pub fn take(&self, serial: u32) -> Option<oneshot::Sender<Reply>> {
        self.state.lock().waiters.remove(&serial)
    }

    /// Remove every waiter and refuse new registrations.
    pub fn drain(&self) -> Vec<(u32, oneshot::Sender<Reply>)> {
        let mut state = self.state.lock();
        state.closed = true;
        state.waiters.drain().collect()
    }

    /// Number of calls awaiting a reply.
    pub fn len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for ReplyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the eventual reply of a call. Await it to get the [`Reply`].
///
/// Dropping it is a valid way to stop waiting; the registry entry stays
/// until the reply arrives or the connection shuts down.
#[derive(Debug)]
pub struct PendingReply {
    serial: u32,
    rx: oneshot::Receiver<Reply>,
}

impl PendingReply {
    /// Serial of the call this reply belongs to.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Wait for the reply.
    pub async fn wait(self) -> Reply {
        self.await
    }
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(BusError::ConnectionClosed)))
    }
}

/// Result of a non-blocking sink delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Consumer buffer full; item dropped.
    Full,
    /// Consumer went away; item dropped.
    Closed,
    /// No sink installed; item dropped.
    Absent,
}

/// A replaceable, optional consumer channel.
pub struct SinkSlot<T> {
    slot: Mutex<Option<mpsc::Sender<T>>>,
}

impl<T> SinkSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Install or clear the sink. The previous sender is dropped, so its
    /// receiver observes the end of the stream once no other clones remain.
    pub fn replace(&self, sink: Option<mpsc::Sender<T>>) {
        let old = std::mem::replace(&mut *self.slot.lock(), sink);
        drop(old);
    }

    /// Drop the current sink.
    pub fn close(&self) {
        self.replace(None);
    }

    pub fn is_installed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Deliver without waiting.
    pub fn try_deliver(&self, item: T) -> Delivery {
        let slot = self.slot.lock();
        let Some(sink) = slot.as_ref() else {
            return Delivery::Absent;
        };
        match sink.try_send(item) {
            Ok(()) => Delivery::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

impl<T> Default for SinkSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
