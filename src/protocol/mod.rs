//! Protocol module - message model, marshalling and framing.
//!
//! This module implements the wire side of the bus protocol:
//! - 16-byte fixed prefix decoding
//! - Typed values and their alignment-aware marshalling
//! - Message encode/decode and structural validation
//! - Frame reader for pulling complete messages off a stream

mod frame_reader;
mod marshal;
mod message;
mod value;
mod wire_format;

pub use frame_reader::FrameReader;
pub use marshal::{Endian, MAX_ARRAY_LENGTH};
pub use message::{HeaderField, Message, MessageType};
pub use value::{signature_of, ObjectPath, Signature, Value, MAX_SIGNATURE_LENGTH};
pub use wire_format::{align8, flags, Prefix, MAX_MESSAGE_SIZE, PREFIX_SIZE, PROTOCOL_VERSION};
