//! Dedicated writer task: the only code that writes to the transport.
//!
//! Callers never touch the socket. They push messages into a bounded mpsc
//! queue and the writer task encodes and writes them strictly one at a time,
//! in submission order, so frames are never interleaved on the wire.
//!
//! # Architecture
//!
//! ```text
//! send()     ─┐
//! send()     ─┼─► mpsc::Sender<Message> ─► Writer Task ─► Transport
//! handler N  ─┘
//! ```
//!
//! Every message leaving the queue has its serial closed out here unless a
//! reply is still expected:
//! - written, no reply expected: serial released
//! - written, reply expected: serial stays held until the reply arrives
//! - failed: waiter (if still registered) gets the error, serial released

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{BusError, Result};
use crate::protocol::Message;
use crate::registry::ReplyRegistry;
use crate::serial::SerialAllocator;

/// Default submission queue capacity. Writes are fast, so this stays small.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Maximum messages written before a flush.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Capacity of the submission queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Reason the transport failed, recorded before `shutdown` is cancelled.
pub(crate) type TransportFailure = Arc<Mutex<Option<String>>>;

/// State the writer needs to close out serials and waiters.
#[derive(Clone)]
pub(crate) struct WriterContext {
    pub replies: Arc<ReplyRegistry>,
    pub serials: SerialAllocator,
    /// Cancelled on connection teardown; cancelled by the writer itself
    /// when the transport fails.
    pub shutdown: CancellationToken,
    pub failure: TransportFailure,
}

/// Handle for submitting messages to the writer task.
///
/// This is cheaply cloneable and can be shared across tasks.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Message>,
}

impl WriterHandle {
    /// Queue a message, waiting if the queue is full.
    ///
    /// On failure the message is handed back so the caller can close out
    /// its serial.
    pub async fn send(&self, msg: Message) -> std::result::Result<(), Message> {
        self.tx.send(msg).await.map_err(|e| e.0)
    }
}

/// Spawn the writer task and return a handle for submitting messages.
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
    ctx: WriterContext,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer, ctx));
    (WriterHandle { tx }, task)
}

/// Main writer loop - receives messages and writes them to the transport.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<Message>,
    mut writer: W,
    ctx: WriterContext,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut outcome = Ok(());

    loop {
        let first = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        // Collect additional ready messages (non-blocking)
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, batch, &ctx).await {
            tracing::error!("Transport write failed: {}", e);
            let reason = format!("write failed: {}", e);
            ctx.failure.lock().get_or_insert_with(|| reason.clone());
            outcome = Err(BusError::Disconnected(reason));
            ctx.shutdown.cancel();
            break;
        }
    }

    // Nothing queued after shutdown is written; fail it all.
    rx.close();
    while let Some(msg) = rx.recv().await {
        complete(&ctx, &msg, Err(BusError::ConnectionClosed));
    }
    let _ = writer.shutdown().await;
    outcome
}

/// Write each message of a batch, then flush once.
///
/// Returns the first transport error. Messages after a failed write in the
/// same batch are failed without being written.
async fn write_batch<W>(
    writer: &mut W,
    batch: Vec<Message>,
    ctx: &WriterContext,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut failure: Option<std::io::Error> = None;
    let mut written = Vec::with_capacity(batch.len());

    for msg in batch {
        if failure.is_some() || ctx.shutdown.is_cancelled() {
            complete(ctx, &msg, Err(BusError::ConnectionClosed));
            continue;
        }
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Could not encode message {}: {}", msg.serial, e);
                complete(ctx, &msg, Err(e));
                continue;
            }
        };
        match writer.write_all(&bytes).await {
            Ok(()) => written.push(msg),
            Err(e) => {
                complete(
                    ctx,
                    &msg,
                    Err(BusError::Io(std::io::Error::new(e.kind(), e.to_string()))),
                );
                failure = Some(e);
            }
        }
    }

    if failure.is_none() {
        if let Err(e) = writer.flush().await {
            failure = Some(e);
        }
    }

    // Bytes already handed to the transport count as sent.
    for msg in &written {
        complete(ctx, msg, Ok(()));
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Close out the serial of a message that left the queue.
fn complete(ctx: &WriterContext, msg: &Message, outcome: std::result::Result<(), BusError>) {
    match outcome {
        Ok(()) => {
            if !msg.expects_reply() {
                ctx.serials.release(msg.serial);
            }
        }
        Err(e) => {
            if msg.expects_reply() {
                // If the waiter is gone it was already resolved, and whoever
                // resolved it released the serial.
                if let Some(tx) = ctx.replies.take(msg.serial) {
                    ctx.serials.release(msg.serial);
                    let _ = tx.send(Err(e));
                }
            } else {
                ctx.serials.release(msg.serial);
            }
        }
    }
}
