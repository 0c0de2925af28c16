//! Reads one complete message at a time from a byte stream.
//!
//! Framing happens in two phases:
//! - read the fixed 16-byte prefix, which gives the byte order, the body
//!   length and the raw header-field length
//! - read the padded header fields plus the body, then decode the whole
//!   buffer
//!
//! Errors fall into two classes. A bad byte-order tag or an undecodable
//! frame is [`BusError::InvalidMessage`]; the frame is discarded and the
//! caller may keep reading. Any short read is [`BusError::Io`] and the
//! stream must be treated as dead (EOF is not distinguished).

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::message::Message;
use super::wire_format::{Prefix, MAX_MESSAGE_SIZE, PREFIX_SIZE};
use crate::error::{BusError, Result};

/// Sequential message reader over an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    /// Reused frame buffer.
    buffer: BytesMut,
    max_message_size: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Create a reader with the default size limit (128 MiB).
    pub fn new(reader: R) -> Self {
        Self::with_max_message_size(reader, MAX_MESSAGE_SIZE)
    }

    /// Create a reader with a custom size limit.
    pub fn with_max_message_size(reader: R, max_message_size: u32) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            max_message_size,
        }
    }

    /// Read and decode the next message.
    pub async fn read_message(&mut self) -> Result<Message> {
        let mut prefix = [0u8; PREFIX_SIZE];
        self.reader.read_exact(&mut prefix).await?;

        let header = Prefix::decode(&prefix)?;

        // Skipping an oversized frame would mean trusting its lengths, and a
        // desynchronised stream cannot be recovered, so this is fatal.
        if header.total_length() > u64::from(self.max_message_size) {
            return Err(BusError::Protocol(format!(
                "message size {} exceeds maximum {}",
                header.total_length(),
                self.max_message_size
            )));
        }

        let total = header.total_length() as usize;
        self.buffer.clear();
        self.buffer.resize(total, 0);
        self.buffer[..PREFIX_SIZE].copy_from_slice(&prefix);
        self.reader
            .read_exact(&mut self.buffer[PREFIX_SIZE..])
            .await?;

        Message::decode(&self.buffer)
    }
}
