//! Bus address parsing and discovery.
//!
//! An address looks like `unix:path=/run/user/1000/bus,guid=...`. Only the
//! `unix` transport is supported, with exactly one of `path` or `abstract`.
//! When the value contains several `;`-separated addresses, the first one
//! is used.
//!
//! # Example
//!
//! ```ignore
//! use busline::transport::{BusAddress, system_bus_address};
//!
//! let address = BusAddress::parse(&system_bus_address())?;
//! ```

use std::path::PathBuf;

use crate::error::{BusError, Result};

/// Environment variable naming the session bus.
pub const SESSION_BUS_ENV: &str = "DBUS_SESSION_BUS_ADDRESS";

/// Environment variable naming the system bus.
pub const SYSTEM_BUS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";

/// System bus address used when the environment does not name one.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Where a unix socket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixTarget {
    /// Filesystem socket.
    Path(PathBuf),
    /// Linux abstract namespace socket.
    Abstract(String),
}

/// A parsed bus address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub target: UnixTarget,
    /// Server GUID advertised in the address, if any.
    pub guid: Option<String>,
}

impl BusAddress {
    /// Parse an address string.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address
            .split(';')
            .map(str::trim)
            .find(|a| !a.is_empty())
            .ok_or_else(|| BusError::Config("empty bus address".into()))?;

        let (transport, options) = address
            .split_once(':')
            .ok_or_else(|| BusError::Config(format!("missing transport in {:?}", address)))?;
        if transport != "unix" {
            return Err(BusError::Config(format!(
                "unsupported transport {:?}",
                transport
            )));
        }

        let mut path = None;
        let mut abstract_name = None;
        let mut guid = None;
        for pair in options.split(',').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| BusError::Config(format!("malformed address option {:?}", pair)))?;
            let value = unescape(value)?;
            match key {
                "path" => path = Some(value),
                "abstract" => abstract_name = Some(value),
                "guid" => guid = Some(value),
                other => tracing::debug!("Ignoring address option {:?}", other),
            }
        }

        let target = match (path, abstract_name) {
            (Some(_), Some(_)) => {
                return Err(BusError::Config(
                    "address sets both path and abstract".into(),
                ))
            }
            (None, None) => {
                return Err(BusError::Config(
                    "address sets neither path nor abstract".into(),
                ))
            }
            (Some(path), None) => UnixTarget::Path(PathBuf::from(path)),
            (None, Some(name)) => UnixTarget::Abstract(name),
        };

        Ok(Self { target, guid })
    }
}

impl std::str::FromStr for BusAddress {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        BusAddress::parse(s)
    }
}

/// Decode `%XX` escapes in an address value.
fn unescape(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value
                .get(i + 1..i + 3)
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| BusError::Config(format!("bad escape in {:?}", value)))?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| BusError::Config(format!("non UTF-8 value {:?}", value)))
}

/// Address of the session bus.
///
/// Uses `DBUS_SESSION_BUS_ADDRESS` unless it is unset, empty or
/// `autolaunch:`, in which case `dbus-launch` is asked.
pub async fn session_bus_address() -> Result<String> {
    if let Ok(address) = std::env::var(SESSION_BUS_ENV) {
        if !address.is_empty() && address != "autolaunch:" {
            return Ok(address);
        }
    }

    let output = tokio::process::Command::new("dbus-launch")
        .output()
        .await
        .map_err(|e| BusError::Config(format!("cannot run dbus-launch: {}", e)))?;
    if !output.status.success() {
        return Err(BusError::Config(format!(
            "dbus-launch exited with {}",
            output.status
        )));
    }
    parse_launch_output(&output.stdout)
}

/// Extract the address from `dbus-launch` output: the text between the
/// first `=` and the end of that line.
pub fn parse_launch_output(output: &[u8]) -> Result<String> {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().unwrap_or("");
    match line.split_once('=') {
        Some((_, address)) if !address.is_empty() => Ok(address.to_string()),
        _ => Err(BusError::Config(
            "couldn't determine address of the session bus".into(),
        )),
    }
}

/// Address of the system bus: `DBUS_SYSTEM_BUS_ADDRESS` or the well-known
/// socket path.
pub fn system_bus_address() -> String {
    match std::env::var(SYSTEM_BUS_ENV) {
        Ok(address) if !address.is_empty() => address,
        _ => DEFAULT_SYSTEM_BUS_ADDRESS.to_string(),
    }
}
