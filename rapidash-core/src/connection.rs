//! The async transport seam. The core stays runtime-agnostic: a concrete
//! runtime crate (e.g. `rapidash-tokio`) implements [`Connection`] over its
//! own socket types and this crate never names a runtime.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;

/// A buffered, line-oriented connection to one cache server.
///
/// Both wire protocols spoken by the drivers are CRLF-line based with exact
/// payload reads in between, so this is the whole surface they need.
#[async_trait]
pub trait Connection: Send + Sized + 'static {
    /// Dial `addr` within `timeout`. Addresses starting with `/` are
    /// absolute Unix-domain socket paths; everything else is `host:port`.
    /// A dial that exceeds the timeout fails with
    /// [`Error::ConnectTimeout`].
    async fn connect(addr: &str, timeout: Duration) -> Result<Self, Error>;

    /// The address this connection was dialed with.
    fn addr(&self) -> &str;

    /// Refresh the deadline applied to subsequent reads and writes. Called
    /// by the pool on every acquisition.
    fn set_timeout(&mut self, timeout: Duration);

    /// Read one line, up to and including the trailing `\n`.
    async fn read_line(&mut self) -> Result<Vec<u8>, Error>;

    /// Fill `buf` exactly.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error>;

    /// Buffer an outgoing write.
    async fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Flush buffered writes to the socket.
    async fn flush(&mut self) -> Result<(), Error>;
}
