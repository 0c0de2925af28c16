//! SASL authentication handshake.
//!
//! Runs on the raw stream before any message is exchanged:
//!
//! ```text
//! client: \0AUTH EXTERNAL 31303030\r\n
//! server: OK 8a0a2b1d...\r\n
//! client: BEGIN\r\n
//! ```
//!
//! The GUID from the `OK` line is returned to the caller. `REJECTED` or any
//! other answer fails the handshake.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{BusError, Result};
use crate::handler::BoxFuture;

/// Longest server line accepted during the handshake.
const MAX_LINE_LENGTH: usize = 16 * 1024;

/// A stream the handshake can run over.
pub trait AuthStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AuthStream for T {}

/// An authentication mechanism.
pub trait Authenticator: Send + Sync {
    /// Run the handshake and return the server GUID.
    fn authenticate<'a>(&'a self, stream: &'a mut dyn AuthStream) -> BoxFuture<'a, Result<String>>;
}

/// `EXTERNAL`: the server checks our socket credentials against the uid we
/// claim.
#[derive(Debug, Clone)]
pub struct ExternalAuth {
    uid: u32,
}

impl ExternalAuth {
    /// Claim the uid of the current process.
    pub fn new() -> Self {
        // SAFETY: getuid has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        Self { uid }
    }

    /// Claim a specific uid.
    pub fn with_uid(uid: u32) -> Self {
        Self { uid }
    }
}

impl Default for ExternalAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for ExternalAuth {
    fn authenticate<'a>(&'a self, stream: &'a mut dyn AuthStream) -> BoxFuture<'a, Result<String>> {
        let initial = hex_encode(self.uid.to_string().as_bytes());
        Box::pin(async move { handshake(stream, "EXTERNAL", &initial).await })
    }
}

/// `ANONYMOUS`: accepted only by buses configured to allow it.
#[derive(Debug, Clone, Default)]
pub struct AnonymousAuth;

impl Authenticator for AnonymousAuth {
    fn authenticate<'a>(&'a self, stream: &'a mut dyn AuthStream) -> BoxFuture<'a, Result<String>> {
        let initial = hex_encode(b"busline");
        Box::pin(async move { handshake(stream, "ANONYMOUS", &initial).await })
    }
}

async fn handshake(stream: &mut dyn AuthStream, mechanism: &str, initial: &str) -> Result<String> {
    stream.write_all(b"\0").await?;
    stream
        .write_all(format!("AUTH {} {}\r\n", mechanism, initial).as_bytes())
        .await?;
    stream.flush().await?;

    let line = read_line(stream).await?;
    let guid = match line.split_once(' ') {
        Some(("OK", guid)) if !guid.trim().is_empty() => guid.trim().to_string(),
        _ if line.starts_with("REJECTED") => {
            return Err(BusError::Auth(format!(
                "server rejected {}: {}",
                mechanism, line
            )))
        }
        _ => {
            return Err(BusError::Auth(format!(
                "unexpected server response: {:?}",
                line
            )))
        }
    };

    stream.write_all(b"BEGIN\r\n").await?;
    stream.flush().await?;
    tracing::debug!("Authenticated with {}, server guid {}", mechanism, guid);
    Ok(guid)
}

/// Read one `\r\n`-terminated line, byte by byte so nothing past the line is
/// consumed.
async fn read_line(stream: &mut dyn AuthStream) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        line.push(byte);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            break;
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(BusError::Auth("server line too long".into()));
        }
    }
    String::from_utf8(line).map_err(|_| BusError::Auth("server line is not UTF-8".into()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
