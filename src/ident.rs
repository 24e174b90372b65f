// The ident service
// Serves the gRPC health service and a plain HTTP fallback on one TLS port

use crate::config::Field;
use crate::harness::{RunContext, Service};
use crate::server::{ListenerMultiplexer, ListenerSettings, RpcServer};
use crate::validation::Violations;
use axum::Router;
use std::path::PathBuf;

pub const FALLBACK_BODY: &str = "hello world";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentConfig {
    pub listen_address: String,
    pub listen_tls_cert: PathBuf,
    pub listen_tls_key: PathBuf,
}

impl IdentConfig {
    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            address: self.listen_address.clone(),
            tls_cert: self.listen_tls_cert.clone(),
            tls_key: self.listen_tls_key.clone(),
        }
    }
}

pub fn fallback_router() -> Router {
    Router::new().fallback(|| async { FALLBACK_BODY })
}

#[derive(Debug, Default)]
pub struct IdentService;

#[tonic::async_trait]
impl Service for IdentService {
    type Config = IdentConfig;

    fn name(&self) -> &str {
        "ident"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn fields(&self) -> Vec<Field<IdentConfig>> {
        vec![
            Field::new(
                "listen_address",
                "127.0.0.1:6000",
                "Address for the TLS listener",
                |c: &mut IdentConfig, v: &str| {
                    c.listen_address = v.to_string();
                    Ok(())
                },
            ),
            Field::new(
                "listen_tls_cert",
                "",
                "PEM certificate chain for the listener",
                |c: &mut IdentConfig, v: &str| {
                    c.listen_tls_cert = PathBuf::from(v);
                    Ok(())
                },
            ),
            Field::new(
                "listen_tls_key",
                "",
                "PEM private key for the listener",
                |c: &mut IdentConfig, v: &str| {
                    c.listen_tls_key = PathBuf::from(v);
                    Ok(())
                },
            ),
        ]
    }

    fn validate(&self, config: &IdentConfig, violations: &mut Violations) {
        violations
            .require_non_empty("listen_address", &config.listen_address)
            .require_non_empty("listen_tls_cert", &config.listen_tls_cert.to_string_lossy())
            .require_non_empty("listen_tls_key", &config.listen_tls_key.to_string_lossy());
    }

    async fn run(&self, ctx: RunContext<IdentConfig>) -> anyhow::Result<()> {
        let rpc = RpcServer::new(self.name()).await;
        let listener =
            ListenerMultiplexer::bind(&ctx.config.listener_settings(), rpc, fallback_router())
                .await?;

        listener.serve(ctx.cancel).await;
        Ok(())
    }
}
