//! Serial number allocation.
//!
//! Serials identify in-flight calls, so a serial must never be handed out
//! while another call still holds it, and `0` is never valid. A single
//! allocator task owns the [`SerialPool`]; every allocate and release goes
//! through its channels, which linearizes concurrent callers without a lock.
//!
//! # Architecture
//!
//! ```text
//! send() ──── allocate ──┐
//! send() ──── allocate ──┼─► Allocator Task (SerialPool)
//! dispatcher ─ release ──┤
//! writer ───── release ──┘
//! ```

use std::collections::HashSet;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{BusError, Result};

/// Cursor plus used-set. Zero is permanently marked used.
#[derive(Debug)]
pub struct SerialPool {
    cursor: u32,
    used: HashSet<u32>,
}

impl SerialPool {
    pub fn new() -> Self {
        let mut used = HashSet::new();
        used.insert(0);
        Self { cursor: 1, used }
    }

    /// Hand out the cursor value and advance past serials still in use.
    ///
    /// Returns `None` only if every non-zero serial is held.
    pub fn allocate(&mut self) -> Option<u32> {
        if self.used.len() > u32::MAX as usize {
            return None;
        }
        let serial = self.cursor;
        self.used.insert(serial);
        while self.used.len() <= u32::MAX as usize && self.used.contains(&self.cursor) {
            self.cursor = self.cursor.wrapping_add(1);
        }
        Some(serial)
    }

    /// Return a serial to the pool. Returns `false` if it was not allocated.
    pub fn release(&mut self, serial: u32) -> bool {
        if serial == 0 {
            return false;
        }
        self.used.remove(&serial)
    }

    /// Number of serials currently held.
    pub fn in_use(&self) -> usize {
        self.used.len() - 1
    }

    pub fn is_allocated(&self, serial: u32) -> bool {
        serial != 0 && self.used.contains(&serial)
    }
}

impl Default for SerialPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the allocator task. Cheaply cloneable.
#[derive(Clone, Debug)]
pub struct SerialAllocator {
    requests: mpsc::UnboundedSender<oneshot::Sender<u32>>,
    releases: mpsc::UnboundedSender<u32>,
    queries: mpsc::UnboundedSender<oneshot::Sender<usize>>,
}

impl SerialAllocator {
    /// Allocate a fresh serial.
    ///
    /// Requests are served in arrival order.
    pub async fn allocate(&self) -> Result<u32> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(tx)
            .map_err(|_| BusError::ConnectionClosed)?;
        rx.await.map_err(|_| BusError::ConnectionClosed)
    }

    /// Release a serial. Never blocks.
    pub fn release(&self, serial: u32) {
        // The task only stops once every handle is gone.
        let _ = self.releases.send(serial);
    }

    /// Number of serials currently held. Releases sent before this call
    /// are already applied.
    pub async fn in_use(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.queries
            .send(tx)
            .map_err(|_| BusError::ConnectionClosed)?;
        rx.await.map_err(|_| BusError::ConnectionClosed)
    }
}

/// Spawn the allocator task and return a handle to it.
///
/// The task exits once every [`SerialAllocator`] clone has been dropped.
pub fn spawn_serial_allocator() -> (SerialAllocator, JoinHandle<()>) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (rel_tx, rel_rx) = mpsc::unbounded_channel();
    let (query_tx, query_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(allocator_loop(req_rx, rel_rx, query_rx));
    (
        SerialAllocator {
            requests: req_tx,
            releases: rel_tx,
            queries: query_tx,
        },
        task,
    )
}

async fn allocator_loop(
    mut requests: mpsc::UnboundedReceiver<oneshot::Sender<u32>>,
    mut releases: mpsc::UnboundedReceiver<u32>,
    mut queries: mpsc::UnboundedReceiver<oneshot::Sender<usize>>,
) {
    let mut pool = SerialPool::new();
    loop {
        tokio::select! {
            // Releases first so freed serials are reused promptly.
            biased;
            released = releases.recv() => match released {
                Some(serial) => {
                    if !pool.release(serial) {
                        tracing::warn!("Release of unallocated serial {}", serial);
                    }
                }
                None => break,
            },
            request = requests.recv() => match request {
                Some(reply) => match pool.allocate() {
                    Some(serial) => {
                        if reply.send(serial).is_err() {
                            // Requester gave up; the serial was never used.
                            pool.release(serial);
                        }
                    }
                    None => tracing::error!("Serial space exhausted"),
                },
                None => break,
            },
            Some(reply) = queries.recv() => {
                let _ = reply.send(pool.in_use());
            }
        }
    }
}
