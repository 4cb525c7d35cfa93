//! CONNECT tunnel relay
//!
//! After the origin connection is up, the client to origin direction runs on a
//! second tracked task while the calling worker copies origin to client. Both
//! directions share a [`CancellationToken`]: whichever finishes first cancels
//! the other, and the caller joins the spawned half before returning, so a
//! tunnel never outlives its connection worker.
//!
//! Idleness is judged for the tunnel as a whole: a direction whose reads time
//! out keeps waiting while the other direction moved bytes within the idle
//! window, so a silent client does not cut off a download in progress.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::request::ConnectTarget;
use crate::response::{send_status, Status};

const RELAY_BUFFER_SIZE: usize = 16384;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Client write failed: {0}")]
    ClientWrite(#[source] io::Error),
}

/// Timeouts and limits for one tunnel
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    /// Header lines discarded after the CONNECT line at most
    pub header_lines: usize,
    /// Wait for each discarded header line
    pub header_timeout: Duration,
    /// Resolve plus TCP handshake with the origin
    pub connect_timeout: Duration,
    /// Time without bytes in either direction after which the tunnel closes
    pub idle_timeout: Duration,
}

impl TunnelSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            header_lines: config.connect_header_lines,
            header_timeout: config.client_read_timeout(),
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.tunnel_read_timeout(),
        }
    }
}

/// Bytes moved by a closed tunnel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub client_to_origin: u64,
    pub origin_to_client: u64,
}

/// Run a CONNECT request to completion
///
/// `client_reader` is positioned right after the request line. Bytes the
/// client sent past the header block stay buffered in it and are relayed to
/// the origin. A connect timeout is answered with `504 Timeout`; other connect
/// failures close the connection without a status line.
pub async fn run_tunnel<R, W>(
    client_reader: R,
    client_writer: W,
    target: &ConnectTarget,
    settings: TunnelSettings,
    tracker: &TaskTracker,
) -> Result<TunnelStats, TunnelError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    run_tunnel_with(
        client_reader,
        client_writer,
        target,
        settings,
        tracker,
        |host: String, port: u16| TcpStream::connect((host, port)),
    )
    .await
}

/// [`run_tunnel`] with the origin connect step supplied by the caller
async fn run_tunnel_with<R, W, C, Fut>(
    mut client_reader: R,
    mut client_writer: W,
    target: &ConnectTarget,
    settings: TunnelSettings,
    tracker: &TaskTracker,
    connect: C,
) -> Result<TunnelStats, TunnelError>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
    C: FnOnce(String, u16) -> Fut,
    Fut: Future<Output = io::Result<TcpStream>>,
{
    let start_time = Instant::now();
    let discarded =
        drain_headers(&mut client_reader, settings.header_lines, settings.header_timeout).await;
    debug!("[CONNECT] Discarded {} header lines for {}", discarded, target);

    let upstream = match connect_origin(target, settings.connect_timeout, connect).await {
        Ok(stream) => stream,
        Err(e) => {
            if let TunnelError::ConnectTimeout { .. } = e {
                ProxyMetrics::record_tunnel("timeout");
                if let Err(write_err) = send_status(&mut client_writer, Status::Timeout).await {
                    debug!("[CONNECT] Could not send 504 for {}: {}", target, write_err);
                }
            } else {
                ProxyMetrics::record_tunnel("failed");
            }
            return Err(e);
        }
    };
    info!("[CONNECT] Connected to upstream {}", target);

    send_status(&mut client_writer, Status::ConnectionEstablished)
        .await
        .map_err(TunnelError::ClientWrite)?;
    ProxyMetrics::record_tunnel("established");
    ProxyMetrics::tunnel_started();

    let (upstream_read, upstream_write) = upstream.into_split();
    let cancel = CancellationToken::new();
    let activity = Arc::new(Activity::new());

    let client_to_origin = tracker.spawn(relay(
        client_reader,
        upstream_write,
        cancel.clone(),
        Arc::clone(&activity),
        settings.idle_timeout,
        "client→upstream",
    ));
    let origin_to_client = relay(
        upstream_read,
        &mut client_writer,
        cancel.clone(),
        activity,
        settings.idle_timeout,
        "upstream→client",
    )
    .await;

    cancel.cancel();
    let client_to_origin = match client_to_origin.await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("[CONNECT] Relay task for {} failed: {}", target, e);
            0
        }
    };

    ProxyMetrics::tunnel_finished(client_to_origin, origin_to_client);
    info!(
        "[CONNECT] Closed {} - duration={:?}, client→upstream={} bytes, upstream→client={} bytes",
        target,
        start_time.elapsed(),
        client_to_origin,
        origin_to_client
    );

    Ok(TunnelStats {
        client_to_origin,
        origin_to_client,
    })
}

/// Discard header lines up to the blank line, reading at most `max_lines`
pub(crate) async fn drain_headers<R>(reader: &mut R, max_lines: usize, wait: Duration) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut discarded = 0;

    while discarded < max_lines {
        line.clear();
        match timeout(wait, reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(_)) => {
                discarded += 1;
                if line.trim_end_matches(['\r', '\n']).is_empty() {
                    break;
                }
            }
        }
    }
    discarded
}

async fn connect_origin<C, Fut>(
    target: &ConnectTarget,
    limit: Duration,
    connect: C,
) -> Result<TcpStream, TunnelError>
where
    C: FnOnce(String, u16) -> Fut,
    Fut: Future<Output = io::Result<TcpStream>>,
{
    match timeout(limit, connect(target.host.clone(), target.port)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TunnelError::Connect {
            target: target.to_string(),
            source,
        }),
        Err(_) => Err(TunnelError::ConnectTimeout {
            target: target.to_string(),
            timeout: limit,
        }),
    }
}

/// Last time either relay direction moved bytes
#[derive(Debug)]
struct Activity {
    started: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_millis.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Copy one direction until EOF, error, tunnel-wide idle timeout or cancellation
async fn relay<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
    activity: Arc<Activity>,
    idle: Duration,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut relayed = 0u64;

    loop {
        // Wait out whatever is left of the idle window since the last byte in either direction
        let wait = idle.saturating_sub(activity.idle_for()).max(Duration::from_millis(1));
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = timeout(wait, reader.read(&mut buf)) => read,
        };

        let n = match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("[CONNECT] {} read error: {}", direction, e);
                break;
            }
            Err(_) if activity.idle_for() < idle => continue,
            Err(_) => {
                debug!("[CONNECT] Tunnel idle for {:?}, closing {}", idle, direction);
                break;
            }
        };

        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = timeout(idle, async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            }) => written,
        };
        match written {
            Ok(Ok(())) => {
                relayed += n as u64;
                activity.touch();
            }
            Ok(Err(e)) => {
                debug!("[CONNECT] {} write error: {}", direction, e);
                break;
            }
            Err(_) => {
                debug!("[CONNECT] {} write stalled for {:?}, closing", direction, idle);
                break;
            }
        }
    }

    cancel.cancel();
    let _ = writer.shutdown().await;
    relayed
}
