// Proxy flow tests
// Drive a real listener on 127.0.0.1 against scripted local origins

use stashproxy::{
    Blocklist, CacheStore, CanonicalUrl, CertificateHint, CommandCertificateHint, Config,
    NoopCertificateHint, ProxyServer, ProxyState, Status,
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn test_config(dir: &Path) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        cache_dir: dir.join("cached"),
        cache_index_path: dir.join("cachedSites.json"),
        blocklist_path: dir.join("blockedSites.json"),
        cert_dir: dir.to_path_buf(),
        accept_timeout_ms: 100,
        client_read_timeout_ms: 300,
        connect_timeout_seconds: 2,
        tunnel_read_timeout_seconds: 2,
        origin_timeout_seconds: 5,
        console_enabled: false,
        ..Config::default()
    }
}

struct ProxyFixture {
    addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ProxyFixture {
    async fn start(config: Config) -> Self {
        Self::start_with_certs(config, Arc::new(NoopCertificateHint)).await
    }

    async fn start_with_certs(config: Config, certs: Arc<dyn CertificateHint>) -> Self {
        let state = ProxyState::load(config, certs).await.unwrap();
        let server = ProxyServer::bind(state).await.unwrap();

        let addr = server.local_addr().unwrap();
        let state = server.state();
        let shutdown = server.shutdown_token();
        let server = tokio::spawn(server.run());

        Self {
            addr,
            state,
            shutdown,
            server,
        }
    }

    /// Send one request and read the whole response
    async fn request(&self, line: &str) -> Vec<u8> {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream
            .write_all(format!("{}\r\nHost: test\r\n\r\n", line).as_bytes())
            .await
            .unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        response
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.server)
            .await
            .expect("server did not shut down")
            .unwrap();
    }
}

/// Origin that answers every request with `body` and counts connections
struct Origin {
    base: String,
    hits: Arc<AtomicUsize>,
}

impl Origin {
    async fn start(status: &'static str, body: &'static [u8]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(stream);
                    let mut line = String::new();
                    loop {
                        line.clear();
                        match reader.read_line(&mut line).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) if line == "\r\n" => break,
                            Ok(_) => {}
                        }
                    }

                    let head = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status,
                        body.len()
                    );
                    let mut stream = reader.into_inner();
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(body).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { base, hits }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn ok_response(body: &[u8]) -> Vec<u8> {
    [Status::Ok.head().into_bytes(), body.to_vec()].concat()
}

#[tokio::test]
async fn test_fetch_then_serve_from_cache() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::start("200 OK", b"hello").await;
    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    let url = origin.url("/a.html");

    let first = proxy.request(&format!("GET {} HTTP/1.0", url)).await;
    assert_eq!(first, ok_response(b"hello"));
    assert_eq!(origin.hits(), 1);

    let key = CanonicalUrl::new(&url);
    let artifact = proxy.state.cache.get(&key).await.expect("artifact stored");
    assert_eq!(proxy.state.cache.read_artifact(&artifact).await.unwrap(), b"hello");

    let second = proxy.request(&format!("GET {} HTTP/1.0", url)).await;
    let third = proxy.request(&format!("GET {} HTTP/1.0", url)).await;
    assert_eq!(second, first);
    assert_eq!(third, first);
    assert_eq!(origin.hits(), 1);
    assert_eq!(proxy.state.fetcher.origin_fetches(), 1);
    assert_eq!(proxy.state.cache.len().await, 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_blocked_url_is_forbidden_and_never_cached() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::start("200 OK", b"secret").await;
    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    let url = origin.url("/blocked.html");

    proxy.state.blocklist.add(CanonicalUrl::new(&url)).await;

    for _ in 0..2 {
        let response = proxy.request(&format!("GET {} HTTP/1.0", url)).await;
        assert_eq!(response, Status::AccessForbidden.head().into_bytes());
    }
    assert_eq!(origin.hits(), 0);
    assert!(!proxy.state.cache.contains(&CanonicalUrl::new(&url)).await);

    proxy.stop().await;
}

#[tokio::test]
async fn test_block_overrides_existing_cache_entry() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::start("200 OK", b"hello").await;
    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    let url = origin.url("/later-blocked.html");

    assert_eq!(
        proxy.request(&format!("GET {} HTTP/1.0", url)).await,
        ok_response(b"hello")
    );

    proxy.state.blocklist.add(CanonicalUrl::new(&url)).await;
    assert_eq!(
        proxy.request(&format!("GET {} HTTP/1.0", url)).await,
        Status::AccessForbidden.head().into_bytes()
    );

    proxy.stop().await;
}

#[tokio::test]
async fn test_blocked_scheme_less_entry_matches_request() {
    let dir = TempDir::new().unwrap();
    let proxy = ProxyFixture::start(test_config(dir.path())).await;

    // Operator typed the host without a scheme
    proxy.state.blocklist.add(CanonicalUrl::new("blocked.com")).await;

    let response = proxy.request("GET http://blocked.com HTTP/1.0").await;
    assert_eq!(response, Status::AccessForbidden.head().into_bytes());

    proxy.stop().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::start("200 OK", b"persisted body").await;
    let url = origin.url("/keep.html");

    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    proxy.request(&format!("GET {} HTTP/1.0", url)).await;
    proxy.state.blocklist.add(CanonicalUrl::new("http://blocked.com")).await;
    proxy.state.blocklist.add(CanonicalUrl::new("tunnel.example:443")).await;

    let cached_before = proxy.state.cache.keys().await;
    let blocked_before = proxy.state.blocklist.entries().await;
    proxy.stop().await;

    let restarted = ProxyFixture::start(test_config(dir.path())).await;
    assert_eq!(restarted.state.cache.keys().await, cached_before);
    assert_eq!(restarted.state.blocklist.entries().await, blocked_before);

    let response = restarted.request(&format!("GET {} HTTP/1.0", url)).await;
    assert_eq!(response, ok_response(b"persisted body"));
    assert_eq!(origin.hits(), 1);

    restarted.stop().await;
}

#[tokio::test]
async fn test_missing_state_files_are_created_empty() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let index = config.cache_index_path.clone();
    let blocklist = config.blocklist_path.clone();

    let proxy = ProxyFixture::start(config).await;
    assert!(index.exists());
    assert!(blocklist.exists());
    assert!(proxy.state.cache.is_empty().await);
    assert!(proxy.state.blocklist.is_empty().await);

    proxy.stop().await;
}

#[tokio::test]
async fn test_origin_error_page_under_image_url_is_not_found() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::start("200 OK", b"<html>no image here</html>").await;
    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    let url = origin.url("/logo.png");

    let response = proxy.request(&format!("GET {} HTTP/1.0", url)).await;
    assert_eq!(response, Status::NotFound.head().into_bytes());
    assert!(!proxy.state.cache.contains(&CanonicalUrl::new(&url)).await);

    proxy.stop().await;
}

#[tokio::test]
async fn test_origin_error_status_is_not_cached() {
    let dir = TempDir::new().unwrap();
    let origin = Origin::start("500 Internal Server Error", b"boom").await;
    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    let url = origin.url("/broken.html");

    let response = proxy.request(&format!("GET {} HTTP/1.0", url)).await;
    assert_eq!(response, Status::NotFound.head().into_bytes());
    assert!(proxy.state.cache.is_empty().await);

    proxy.stop().await;
}

#[tokio::test]
async fn test_malformed_request_is_closed_silently() {
    let dir = TempDir::new().unwrap();
    let proxy = ProxyFixture::start(test_config(dir.path())).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    stream.write_all(b"GARBAGE\r\n").await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(response.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_silent_client_is_dropped_after_read_timeout() {
    let dir = TempDir::new().unwrap();
    let proxy = ProxyFixture::start(test_config(dir.path())).await;

    let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
    let mut response = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;

    assert!(read.is_ok(), "proxy kept an idle connection open");
    assert!(response.is_empty());

    proxy.stop().await;
}

/// Origin that replies `pong` after reading `ping`, then closes
async fn echo_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                if stream.read_exact(&mut buf).await.is_ok() && &buf == b"ping" {
                    let _ = stream.write_all(b"pong").await;
                }
            });
        }
    });
    addr
}

async fn open_tunnel(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream
        .write_all(
            format!(
                "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: keep-alive\r\n\r\n",
                target, target
            )
            .as_bytes(),
        )
        .await
        .unwrap();

    let head = Status::ConnectionEstablished.head();
    let mut received = vec![0u8; head.len()];
    stream.read_exact(&mut received).await.unwrap();
    (stream, received)
}

#[tokio::test]
async fn test_connect_relays_bytes_both_ways() {
    let dir = TempDir::new().unwrap();
    let target = echo_origin().await;

    // A certificate tool that cannot run must not affect tunnelling
    let certs = Arc::new(CommandCertificateHint::new(
        "/nonexistent/cert-tool",
        dir.path(),
    ));
    let proxy = ProxyFixture::start_with_certs(test_config(dir.path()), certs).await;

    let (mut stream, head) = open_tunnel(proxy.addr, target).await;
    assert_eq!(head, Status::ConnectionEstablished.head().into_bytes());

    stream.write_all(b"ping").await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"pong");

    assert!(!dir.path().join("127.0.0.1.pem").exists());
    assert!(proxy.state.cache.is_empty().await);

    proxy.stop().await;
}

#[tokio::test]
async fn test_blocked_connect_target() {
    let dir = TempDir::new().unwrap();
    let target = echo_origin().await;
    let proxy = ProxyFixture::start(test_config(dir.path())).await;

    proxy
        .state
        .blocklist
        .add(CanonicalUrl::new(&target.to_string()))
        .await;

    let response = proxy.request(&format!("CONNECT {} HTTP/1.1", target)).await;
    assert_eq!(response, Status::AccessForbidden.head().into_bytes());

    proxy.stop().await;
}

#[tokio::test]
async fn test_connect_refused_closes_without_status() {
    let dir = TempDir::new().unwrap();
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.local_addr().unwrap();
    drop(closed);

    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    let response = proxy.request(&format!("CONNECT {} HTTP/1.1", target)).await;
    assert!(response.is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_open_tunnel() {
    let dir = TempDir::new().unwrap();

    // Origin that holds the connection open until the client leaves
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        }
    });

    let mut config = test_config(dir.path());
    config.tunnel_read_timeout_seconds = 30;
    let proxy = ProxyFixture::start(config).await;

    let (stream, _) = open_tunnel(proxy.addr, target).await;
    proxy.shutdown.cancel();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!proxy.server.is_finished(), "shutdown did not wait for the tunnel");

    // State is persisted before draining
    assert!(proxy.state.config.cache_index_path.exists());

    drop(stream);
    tokio::time::timeout(Duration::from_secs(5), proxy.server)
        .await
        .expect("server did not finish after the tunnel closed")
        .unwrap();
}

#[tokio::test]
async fn test_stopped_proxy_refuses_connections() {
    let dir = TempDir::new().unwrap();
    let proxy = ProxyFixture::start(test_config(dir.path())).await;
    let addr = proxy.addr;

    proxy.stop().await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shared_stores_can_be_injected() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let cache = Arc::new(CacheStore::new(dir.path().join("cached"), None));
    let blocklist = Arc::new(Blocklist::with_entries([CanonicalUrl::new("http://pre.blocked/")]));
    std::fs::create_dir_all(dir.path().join("cached")).unwrap();

    let state = ProxyState::new(config, cache, blocklist, Arc::new(NoopCertificateHint)).unwrap();
    let server = ProxyServer::bind(state).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_token();
    let handle = tokio::spawn(server.run());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET http://pre.blocked/ HTTP/1.0\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, Status::AccessForbidden.head().into_bytes());

    shutdown.cancel();
    handle.await.unwrap();
}

// Needs a route that silently drops SYNs; 10.255.255.1 does on most networks
#[tokio::test]
#[ignore]
async fn test_connect_timeout_answers_504() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.connect_timeout_seconds = 1;
    let proxy = ProxyFixture::start(config).await;

    let response = proxy.request("CONNECT 10.255.255.1:80 HTTP/1.1").await;
    assert_eq!(response, Status::Timeout.head().into_bytes());

    proxy.stop().await;
}
