// Integration tests for the multiplexed TLS listener
// A self-signed certificate is minted per test; clients speak HTTP/1.1 or HTTP/2 over rustls

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, ServerName};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use svc_harness::HarnessError;
use svc_harness::ident::{FALLBACK_BODY, fallback_router};
use svc_harness::server::{ListenerMultiplexer, ListenerSettings, RpcServer};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: TempDir,
    settings: ListenerSettings,
    cert: CertificateDer<'static>,
}

fn fixture(address: &str) -> Fixture {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, certified.cert.pem()).unwrap();
    std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    Fixture {
        settings: ListenerSettings {
            address: address.to_string(),
            tls_cert: cert_path,
            tls_key: key_path,
        },
        cert: certified.cert.der().clone(),
        _dir: dir,
    }
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("listener drains after cancel")
            .unwrap();
    }
}

async fn start(fixture: &Fixture, fallback: axum::Router) -> Running {
    let rpc = RpcServer::new("ident").await;
    let mux = ListenerMultiplexer::bind(&fixture.settings, rpc, fallback)
        .await
        .unwrap();
    let addr = mux.local_addr();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(mux.serve(cancel.clone()));
    Running {
        addr,
        cancel,
        handle,
    }
}

async fn connect_tls(
    addr: SocketAddr,
    cert: &CertificateDer<'static>,
    alpn: &[u8],
) -> TlsStream<TcpStream> {
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert.clone()).unwrap();

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![alpn.to_vec()];

    let stream = TcpStream::connect(addr).await.unwrap();
    let domain = ServerName::try_from("localhost").unwrap();
    let tls = TlsConnector::from(Arc::new(config))
        .connect(domain, stream)
        .await
        .unwrap();

    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(alpn));
    tls
}

fn counting_fallback(hits: Arc<AtomicUsize>) -> axum::Router {
    axum::Router::new().fallback(move || {
        let hits = hits.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            FALLBACK_BODY
        }
    })
}

// gRPC frame: uncompressed flag, big-endian length, then the message bytes
fn grpc_frame(message: &[u8]) -> Bytes {
    let mut frame = vec![0u8];
    frame.extend_from_slice(&(message.len() as u32).to_be_bytes());
    frame.extend_from_slice(message);
    Bytes::from(frame)
}

#[tokio::test]
async fn test_http1_get_reaches_fallback() {
    let fixture = fixture("127.0.0.1:0");
    let hits = Arc::new(AtomicUsize::new(0));
    let running = start(&fixture, counting_fallback(hits.clone())).await;

    let tls = connect_tls(running.addr, &fixture.cert, b"http/1.1").await;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .uri("/")
        .header(HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], FALLBACK_BODY.as_bytes());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    drop(sender);
    running.stop().await;
}

#[tokio::test]
async fn test_grpc_content_type_over_http1_is_not_rpc() {
    let fixture = fixture("127.0.0.1:0");
    let hits = Arc::new(AtomicUsize::new(0));
    let running = start(&fixture, counting_fallback(hits.clone())).await;

    let tls = connect_tls(running.addr, &fixture.cert, b"http/1.1").await;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/grpc.health.v1.Health/Check")
        .header(HOST, "localhost")
        .header(CONTENT_TYPE, "application/grpc")
        .body(Full::new(grpc_frame(&[])))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    drop(sender);
    running.stop().await;
}

#[tokio::test]
async fn test_http2_grpc_health_check_reaches_rpc_server() {
    let fixture = fixture("127.0.0.1:0");
    let hits = Arc::new(AtomicUsize::new(0));
    let running = start(&fixture, counting_fallback(hits.clone())).await;

    let tls = connect_tls(running.addr, &fixture.cert, b"h2").await;
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
            .await
            .unwrap();
    tokio::spawn(conn);

    // HealthCheckRequest { service: "ident" }
    let mut message = vec![0x0a, 0x05];
    message.extend_from_slice(b"ident");
    let request = Request::builder()
        .method(Method::POST)
        .uri("https://localhost/grpc.health.v1.Health/Check")
        .header(CONTENT_TYPE, "application/grpc")
        .header("te", "trailers")
        .body(Full::new(grpc_frame(&message)))
        .unwrap();
    let response = sender.send_request(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/grpc"));

    let collected = response.into_body().collect().await.unwrap();
    let grpc_status = collected
        .trailers()
        .and_then(|t| t.get("grpc-status"))
        .map(|v| v.to_str().unwrap().to_string());
    assert_eq!(grpc_status.as_deref(), Some("0"));

    // HealthCheckResponse { status: SERVING }
    assert_eq!(collected.to_bytes(), grpc_frame(&[0x08, 0x01]));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    drop(sender);
    running.stop().await;
}

#[tokio::test]
async fn test_http2_plain_request_reaches_fallback() {
    let fixture = fixture("127.0.0.1:0");
    let running = start(&fixture, fallback_router()).await;

    let tls = connect_tls(running.addr, &fixture.cert, b"h2").await;
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
            .await
            .unwrap();
    tokio::spawn(conn);

    let request = Request::builder()
        .uri("https://localhost/status")
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = sender.send_request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], FALLBACK_BODY.as_bytes());

    drop(sender);
    running.stop().await;
}

#[tokio::test]
async fn test_failed_handshake_does_not_stop_listener() {
    let fixture = fixture("127.0.0.1:0");
    let running = start(&fixture, fallback_router()).await;

    // plaintext HTTP against the TLS port
    {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = TcpStream::connect(running.addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf)).await;
    }

    let tls = connect_tls(running.addr, &fixture.cert, b"http/1.1").await;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);
    let request = Request::builder()
        .uri("/")
        .header(HOST, "localhost")
        .body(Empty::<Bytes>::new())
        .unwrap();
    assert_eq!(sender.send_request(request).await.unwrap().status(), StatusCode::OK);

    drop(sender);
    running.stop().await;
}

#[tokio::test]
async fn test_missing_certificate_binds_nothing() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = probe.local_addr().unwrap().to_string();
    drop(probe);

    let mut fixture = fixture(&address);
    fixture.settings.tls_cert = fixture.settings.tls_cert.with_file_name("missing.pem");

    let rpc = RpcServer::new("ident").await;
    let err = ListenerMultiplexer::bind(&fixture.settings, rpc, fallback_router())
        .await
        .err()
        .expect("bind must fail");
    assert!(matches!(err, HarnessError::TlsLoad { .. }));

    // the port was never taken
    assert!(std::net::TcpListener::bind(&address).is_ok());
}

#[tokio::test]
async fn test_malformed_key_is_tls_error() {
    let fixture = fixture("127.0.0.1:0");
    std::fs::write(&fixture.settings.tls_key, "-----BEGIN NOTHING-----\n").unwrap();

    let rpc = RpcServer::new("ident").await;
    let err = ListenerMultiplexer::bind(&fixture.settings, rpc, fallback_router())
        .await
        .err()
        .expect("bind must fail");
    assert!(matches!(err, HarnessError::TlsLoad { .. }));
}

#[tokio::test]
async fn test_unusable_address_is_listen_error() {
    let fixture = fixture("127.0.0.1:notaport");

    let rpc = RpcServer::new("ident").await;
    let err = ListenerMultiplexer::bind(&fixture.settings, rpc, fallback_router())
        .await
        .err()
        .expect("bind must fail");
    match err {
        HarnessError::Listen { address, .. } => assert_eq!(address, "127.0.0.1:notaport"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_cancel_stops_accepting() {
    let fixture = fixture("127.0.0.1:0");
    let running = start(&fixture, fallback_router()).await;
    let addr = running.addr;

    running.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr)).await;
    assert!(matches!(result, Ok(Err(_))));
}
