//! Fixed message prefix.
//!
//! Every message starts with a 16-byte prefix:
//! ```text
//! ┌────────┬──────┬───────┬─────────┬──────────┬──────────┬──────────────┐
//! │ Endian │ Type │ Flags │ Version │ Body len │ Serial   │ Fields len   │
//! │ 1 byte │ 1    │ 1     │ 1       │ uint32   │ uint32   │ uint32       │
//! └────────┴──────┴───────┴─────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! Multi-byte integers use the byte order declared by the first byte
//! (`l` little endian, `B` big endian). The header-field block that follows
//! is padded to a multiple of 8 before the body begins.

use super::marshal::Endian;
use crate::error::{BusError, Result};

/// Size of the fixed prefix in bytes.
pub const PREFIX_SIZE: usize = 16;

/// Major protocol version written into every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest message accepted or produced (128 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 128 * 1024 * 1024;

/// Message flag bits.
pub mod flags {
    /// The caller does not want a reply; no waiter is registered.
    pub const NO_REPLY_EXPECTED: u8 = 0x1;
    /// Do not launch an owner for the destination name.
    pub const NO_AUTO_START: u8 = 0x2;
    /// The caller is prepared to wait for interactive authorization.
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: u8 = 0x4;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Decoded fixed prefix: enough to know how many more bytes to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix {
    pub endian: Endian,
    /// Raw body length.
    pub body_length: u32,
    /// Raw header-field block length, before padding.
    pub fields_length: u32,
}

impl Prefix {
    /// Decode the 16-byte prefix.
    ///
    /// An unknown byte-order tag is a malformed message, not a stream error.
    pub fn decode(buf: &[u8; PREFIX_SIZE]) -> Result<Self> {
        let endian = Endian::from_tag(buf[0]).ok_or_else(|| {
            BusError::InvalidMessage(format!("invalid byte order tag 0x{:02x}", buf[0]))
        })?;
        Ok(Self {
            endian,
            body_length: endian.read_u32([buf[4], buf[5], buf[6], buf[7]]),
            fields_length: endian.read_u32([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    /// Bytes still to read after the prefix: padded fields plus body.
    pub fn remaining_length(&self) -> u64 {
        align8(u64::from(self.fields_length)) + u64::from(self.body_length)
    }

    /// Total message size including the prefix.
    pub fn total_length(&self) -> u64 {
        PREFIX_SIZE as u64 + self.remaining_length()
    }
}

/// Round up to the next multiple of 8.
#[inline]
pub fn align8(n: u64) -> u64 {
    (n + 7) & !7
}
