use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Proxy-Agent header sent with every status line
pub const PROXY_AGENT: &str = concat!("StashProxy/", env!("CARGO_PKG_VERSION"));

/// Status lines emitted by the proxy itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Cache hit or successful origin fetch, sent before the body
    Ok,
    /// CONNECT tunnel ready
    ConnectionEstablished,
    /// Target is on the blocklist
    AccessForbidden,
    /// Origin did not return a valid resource of the expected kind
    NotFound,
    /// Origin connect exceeded the configured timeout
    Timeout,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok | Self::ConnectionEstablished => 200,
            Self::AccessForbidden => 403,
            Self::NotFound => 404,
            Self::Timeout => 504,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ConnectionEstablished => "Connection established",
            Self::AccessForbidden => "Access Forbidden",
            Self::NotFound => "Not Found",
            Self::Timeout => "Timeout",
        }
    }

    /// Full response head: status line, Proxy-Agent header, blank line
    pub fn head(self) -> String {
        format!(
            "HTTP/1.0 {} {}\r\nProxy-Agent: {}\r\n\r\n",
            self.code(),
            self.reason(),
            PROXY_AGENT
        )
    }
}

/// Write and flush a response head
pub async fn send_status<W>(writer: &mut W, status: Status) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(status.head().as_bytes()).await?;
    writer.flush().await
}
