// Multiplexed TLS listener
// One port serves gRPC (HTTP/2 + application/grpc) and plain HTTP side by side

use crate::error::HarnessError;
use crate::tls;
use axum::Router;
use http::header::CONTENT_TYPE;
use http::{Request, Version};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::body::Body as TonicBody;
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic_health::ServingStatus;
use tonic_health::server::HealthReporter;
use tower::{Service, ServiceExt};
use tracing::Instrument;
use tracing::instrument::WithSubscriber;
use uuid::Uuid;

pub const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// True when a request must go to the RPC server: HTTP/2 with a gRPC content type.
///
/// Only the head is inspected; the body stream is left untouched.
pub fn is_rpc_request<B>(req: &Request<B>) -> bool {
    req.version() == Version::HTTP_2
        && req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with(GRPC_CONTENT_TYPE))
}

/// gRPC routes with the standard health service already registered.
pub struct RpcServer {
    routes: Routes,
    health: HealthReporter,
    component: String,
}

impl RpcServer {
    /// Registers the health service and marks `component` as serving.
    pub async fn new(component: impl Into<String>) -> Self {
        let component = component.into();
        let (health, health_service) = tonic_health::server::health_reporter();
        health
            .set_service_status(&component, ServingStatus::Serving)
            .await;

        RpcServer {
            routes: Routes::new(health_service),
            health,
            component,
        }
    }

    pub fn add_service<S>(mut self, svc: S) -> Self
    where
        S: Service<Request<TonicBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        self.routes = self.routes.add_service(svc);
        self
    }

    pub fn health_reporter(&self) -> HealthReporter {
        self.health.clone()
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    fn into_router(self) -> Router {
        self.routes.into_axum_router()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerSettings {
    pub address: String,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
}

pub struct ListenerMultiplexer {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    rpc: Router,
    fallback: Router,
}

impl ListenerMultiplexer {
    /// Loads TLS material, then binds. A TLS failure leaves no socket bound.
    pub async fn bind(
        settings: &ListenerSettings,
        rpc: RpcServer,
        fallback: Router,
    ) -> Result<Self, HarnessError> {
        let tls_config = tls::server_config(&settings.tls_cert, &settings.tls_key)?;

        let listen_err = |source| HarnessError::Listen {
            address: settings.address.clone(),
            source,
        };
        let listener = TcpListener::bind(&settings.address)
            .await
            .map_err(listen_err)?;
        let local_addr = listener.local_addr().map_err(listen_err)?;

        tracing::info!(
            address = %local_addr,
            rpc_component = %rpc.component(),
            "Multiplexed TLS listener bound"
        );

        Ok(ListenerMultiplexer {
            listener,
            local_addr,
            acceptor: TlsAcceptor::from(tls_config),
            rpc: rpc.into_router(),
            fallback,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `cancel` fires, then waits for in-flight ones to drain.
    pub async fn serve(self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let span = tracing::info_span!(
                            "connection",
                            conn_id = %Uuid::new_v4(),
                            peer = %peer_addr,
                        );

                        let connection = handle_connection(
                            stream,
                            self.acceptor.clone(),
                            self.rpc.clone(),
                            self.fallback.clone(),
                            cancel.clone(),
                        );

                        tracker.spawn(connection.instrument(span).with_current_subscriber());
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        // Continue accepting other connections
                    }
                }
            }
        }

        tracker.close();
        tracing::info!(in_flight = tracker.len(), "Draining connections");
        tracker.wait().await;
        tracing::info!("Listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    rpc: Router,
    fallback: Router,
    cancel: CancellationToken,
) {
    let tls_stream = tokio::select! {
        _ = cancel.cancelled() => return,
        handshake = acceptor.accept(stream) => match handshake {
            Ok(tls_stream) => tls_stream,
            Err(e) => {
                tracing::warn!(error = %e, "TLS handshake failed");
                return;
            }
        },
    };

    let negotiated = tls_stream
        .get_ref()
        .1
        .alpn_protocol()
        .map(|p| String::from_utf8_lossy(p).into_owned());
    tracing::debug!(alpn = ?negotiated, "Connection established");

    let service = service_fn(move |req: Request<Incoming>| {
        let target = if is_rpc_request(&req) {
            rpc.clone()
        } else {
            fallback.clone()
        };
        target.oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(tls_stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    match result {
        Ok(()) => tracing::debug!("Connection closed"),
        Err(e) => tracing::warn!(error = %e, "Connection handling error"),
    }
}
