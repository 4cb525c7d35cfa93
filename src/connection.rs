//! Per-connection worker
//!
//! Reads one request line, applies the blocklist, and hands the connection to
//! the tunnel relay, the cache or the origin fetcher. Every failure is logged
//! and ends only this connection.

use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::ArtifactKind;
use crate::fetcher::{serve_cached, FetchError};
use crate::metrics::ProxyMetrics;
use crate::request::{parse_request_line, RequestLine};
use crate::response::{send_status, Status};
use crate::server::ProxyState;
use crate::tunnel::{drain_headers, run_tunnel, TunnelError, TunnelSettings};

/// Serve a single accepted client socket
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: &ProxyState) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    match timeout(state.config.client_read_timeout(), reader.read_line(&mut line)).await {
        Ok(Ok(0)) => {
            debug!("[HTTP] {} closed before sending a request", peer);
            return;
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!("[HTTP] Failed to read request from {}: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("[HTTP] No request from {} within {:?}", peer, state.config.client_read_timeout());
            return;
        }
    }

    let request = match parse_request_line(&line) {
        Ok(request) => request,
        Err(e) => {
            debug!("[HTTP] Malformed request from {}: {}", peer, e);
            ProxyMetrics::record_request("unknown", "malformed");
            return;
        }
    };
    let method = method_label(&request);
    let key = request.canonical_url();
    let settings = TunnelSettings::from_config(&state.config);

    if state.blocklist.is_blocked(&key).await {
        drain_headers(&mut reader, settings.header_lines, settings.header_timeout).await;
        info!("[BLOCK] Refused {} {} from {}", request.method, key, peer);
        ProxyMetrics::record_blocked(request.is_connect());
        ProxyMetrics::record_request(method, "blocked");
        if let Err(e) = send_status(&mut write_half, Status::AccessForbidden).await {
            debug!("[BLOCK] Could not send 403 to {}: {}", peer, e);
        }
        let _ = write_half.shutdown().await;
        return;
    }

    if request.is_connect() {
        let target = match request.connect_target() {
            Ok(target) => target,
            Err(e) => {
                warn!("[CONNECT] {} from {}", e, peer);
                ProxyMetrics::record_request(method, "malformed");
                return;
            }
        };
        info!("[CONNECT] {} from {}", target, peer);
        state.certs.ensure_certificate(&target.host);

        match run_tunnel(reader, write_half, &target, settings, &state.tracker).await {
            Ok(_) => ProxyMetrics::record_request(method, "tunneled"),
            Err(e @ TunnelError::ConnectTimeout { .. }) => {
                warn!("[CONNECT] {}", e);
                ProxyMetrics::record_request(method, "timeout");
            }
            Err(e) => {
                warn!("[CONNECT] {}", e);
                ProxyMetrics::record_request(method, "error");
            }
        }
        return;
    }

    // Unread request bytes would turn the final close into a reset
    drain_headers(&mut reader, settings.header_lines, settings.header_timeout).await;

    info!("[HTTP] {} {} from {}", request.method, key, peer);
    if let Some(host) = key.host() {
        state.certs.ensure_certificate(&host);
    }

    if let Some(artifact) = state.cache.get(&key).await {
        ProxyMetrics::record_cache_lookup(true);
        match serve_cached(&state.cache, &artifact, &mut write_half).await {
            Ok(bytes) => {
                info!("[CACHE] Served {} from cache ({} bytes)", key, bytes);
                ProxyMetrics::record_request(method, "cache_hit");
                let _ = write_half.shutdown().await;
                return;
            }
            Err(FetchError::Artifact(e)) => {
                warn!("[CACHE] {} unreadable, refetching: {}", key, e);
            }
            Err(e) => {
                warn!("[CACHE] Failed to serve {}: {}", key, e);
                answer_failure(&mut write_half, &e).await;
                ProxyMetrics::record_request(method, "error");
                return;
            }
        }
    } else {
        ProxyMetrics::record_cache_lookup(false);
    }

    let kind = ArtifactKind::for_url(&key);
    match state
        .fetcher
        .fetch(&key, kind, &state.cache, &mut write_half)
        .await
    {
        Ok(_) => ProxyMetrics::record_request(method, "fetched"),
        Err(e) => {
            warn!("[HTTP] {}", e);
            answer_failure(&mut write_half, &e).await;
            ProxyMetrics::record_request(method, "error");
        }
    }
    let _ = write_half.shutdown().await;
}

/// Best-effort status line for failures that happen before the response head
async fn answer_failure<W>(writer: &mut W, error: &FetchError)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    if let Some(status) = error.status() {
        if let Err(e) = send_status(writer, status).await {
            debug!("[HTTP] Could not send {} status: {}", status.code(), e);
        }
    }
}

/// Keeps the method label set small for metrics
fn method_label(request: &RequestLine) -> &'static str {
    if request.is_connect() {
        "CONNECT"
    } else if request.method.eq_ignore_ascii_case("GET") {
        "GET"
    } else {
        "OTHER"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_labels() {
        let label = |line: &str| method_label(&parse_request_line(line).unwrap());

        assert_eq!(label("CONNECT a.com:443 HTTP/1.1"), "CONNECT");
        assert_eq!(label("get http://a.com/ HTTP/1.0"), "GET");
        assert_eq!(label("POST http://a.com/ HTTP/1.0"), "OTHER");
    }
}
