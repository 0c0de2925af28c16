//! Unix domain socket transport.
//!
//! - Filesystem sockets: `unix:path=...`
//! - Abstract sockets (Linux only): `unix:abstract=...`
//!
//! # Example
//!
//! ```ignore
//! use busline::transport::{connect, BusAddress};
//!
//! let address = BusAddress::parse("unix:path=/run/user/1000/bus")?;
//! let stream = connect(&address).await?;
//! let (reader, writer) = stream.into_split();
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::{BusAddress, UnixTarget};
use crate::error::{BusError, Result};

/// A connected bus socket.
pub struct BusStream {
    stream: UnixStream,
}

impl BusStream {
    /// Split into owned read and write halves.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }

    /// Get a reference to the underlying stream.
    pub fn inner(&self) -> &UnixStream {
        &self.stream
    }
}

impl From<UnixStream> for BusStream {
    fn from(stream: UnixStream) -> Self {
        Self { stream }
    }
}

/// Connect to the socket named by `address`.
pub async fn connect(address: &BusAddress) -> Result<BusStream> {
    let stream = match &address.target {
        UnixTarget::Path(path) => UnixStream::connect(path).await?,
        UnixTarget::Abstract(name) => connect_abstract(name)?,
    };
    tracing::debug!("Connected to {:?}", address.target);
    Ok(BusStream { stream })
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixStream as StdUnixStream};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = StdUnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    Ok(UnixStream::from_std(stream)?)
}

#[cfg(not(target_os = "linux"))]
fn connect_abstract(_name: &str) -> Result<UnixStream> {
    Err(BusError::Config(
        "abstract sockets are only supported on Linux".into(),
    ))
}

impl AsyncRead for BusStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for BusStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Whether a connect error means "nothing is listening there".
pub fn is_not_listening(err: &BusError) -> bool {
    matches!(
        err,
        BusError::Io(e) if matches!(
            e.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
        )
    )
}
