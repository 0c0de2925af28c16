//! Transport module - bus addresses and socket connection.
//!
//! Provides:
//! - Address parsing and session/system bus discovery
//! - Unix domain sockets, filesystem and abstract (Linux)

mod address;
mod unix;

pub use address::{
    parse_launch_output, session_bus_address, system_bus_address, BusAddress, UnixTarget,
    DEFAULT_SYSTEM_BUS_ADDRESS, SESSION_BUS_ENV, SYSTEM_BUS_ENV,
};
pub use unix::{connect, is_not_listening, BusStream};
