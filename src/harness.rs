// Service harness
// Runs the fixed startup sequence, then hands control to the pluggable service:
// flags -> bind -> logger -> service config -> validate -> audit -> summary -> run

use crate::audit::{ConfigSnapshot, EnvironmentAuditor};
use crate::config::{ConfigBinder, Field, GlobalConfig, ResolvedConfig, bind_fields, env_prefix};
use crate::error::{BindingError, HarnessError};
use crate::logger::{Logger, LoggerFactory};
use crate::validation::{self, Violations};
use clap::error::ErrorKind;
use std::collections::HashMap;
use std::ffi::OsString;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;

/// A long-running service driven by the harness.
#[tonic::async_trait]
pub trait Service: Send + Sync {
    type Config: Default + Send + Sync + 'static;

    /// Also the environment namespace: `ident` reads `IDENT_*`.
    fn name(&self) -> &str;

    /// Reported in the startup summary. Implement with the service crate's own
    /// `env!("CARGO_PKG_VERSION")`.
    fn version(&self) -> &str;

    fn fields(&self) -> Vec<Field<Self::Config>>;

    /// Reports every problem with `config`; the harness aggregates them.
    fn validate(&self, config: &Self::Config, violations: &mut Violations);

    /// Serves until `ctx.cancel` fires. Draining in-flight work is up to the service.
    async fn run(&self, ctx: RunContext<Self::Config>) -> anyhow::Result<()>;
}

/// Everything a service needs once startup succeeded.
#[derive(Debug)]
pub struct RunContext<C> {
    pub config: C,
    pub logger: Logger,
    pub cancel: CancellationToken,
}

/// Result of a successful startup sequence, before the service runs.
#[derive(Debug)]
pub struct Startup<C> {
    pub global: GlobalConfig,
    pub config: C,
    pub logger: Logger,
    pub resolved: ResolvedConfig,
    pub snapshot: ConfigSnapshot,
    pub unknown_env: Vec<String>,
}

/// Runs the service with the process arguments and environment.
pub async fn run<S: Service>(service: S) -> Result<(), HarnessError> {
    let (env, skipped) = split_environment(std::env::vars_os());

    let prefix = env_prefix(service.name());
    let ignored: Vec<&String> = skipped.iter().filter(|n| n.starts_with(&prefix)).collect();
    if !ignored.is_empty() {
        Logger::bootstrap().in_scope(|| {
            for name in ignored {
                tracing::warn!(env_name = %name, "Ignoring environment variable that is not valid UTF-8");
            }
        });
    }

    run_with(service, std::env::args_os(), env).await
}

/// Splits raw environment pairs into the UTF-8 map the harness binds from and the
/// (lossily decoded) names of variables that had to be left out.
pub fn split_environment<I>(vars: I) -> (HashMap<String, String>, Vec<String>)
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env = HashMap::new();
    let mut skipped = Vec::new();

    for (name, value) in vars {
        match (name.to_str(), value.to_str()) {
            (Some(n), Some(v)) => {
                env.insert(n.to_string(), v.to_string());
            }
            _ => skipped.push(name.to_string_lossy().into_owned()),
        }
    }

    skipped.sort();
    (env, skipped)
}

pub async fn run_with<S, I, T>(
    service: S,
    args: I,
    env: HashMap<String, String>,
) -> Result<(), HarnessError>
where
    S: Service,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let startup = match prepare(&service, args, &env) {
        Ok(startup) => startup,
        Err(HarnessError::Binding(BindingError::Cli(e))) if is_informational(&e) => e.exit(),
        Err(e) => return Err(e),
    };

    let logger = startup.logger;
    let cancel = CancellationToken::new();

    let signal_token = cancel.clone();
    let signal_task = tokio::spawn(
        async move {
            shutdown_signal().await;
            signal_token.cancel();
        }
        .with_subscriber(logger.dispatch().clone()),
    );

    let ctx = RunContext {
        config: startup.config,
        logger: logger.clone(),
        cancel,
    };
    let result = service
        .run(ctx)
        .with_subscriber(logger.dispatch().clone())
        .await;
    signal_task.abort();

    match result {
        Ok(()) => {
            logger.in_scope(|| tracing::info!(service = %service.name(), "Shutdown complete"));
            Ok(())
        }
        Err(e) => {
            logger.in_scope(|| tracing::error!(error = %format!("{e:#}"), "Service exited with error"));
            Err(HarnessError::Run(e))
        }
    }
}

/// Startup sequence with the logger writing to stderr.
pub fn prepare<S, I, T>(
    service: &S,
    args: I,
    env: &HashMap<String, String>,
) -> Result<Startup<S::Config>, HarnessError>
where
    S: Service,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    prepare_with(service, args, env, LoggerFactory::build)
}

/// Startup sequence with a caller-supplied logger constructor.
///
/// Failures before the logger exists go to a bootstrap console logger; later
/// failures go to the configured one. Nothing here retries.
pub fn prepare_with<S, I, T, F>(
    service: &S,
    args: I,
    env: &HashMap<String, String>,
    build_logger: F,
) -> Result<Startup<S::Config>, HarnessError>
where
    S: Service,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: FnOnce(&GlobalConfig) -> Result<Logger, HarnessError>,
{
    let fields = service.fields();

    let (binder, resolved, global, logger) =
        match bind_global(service, &fields, args, env, build_logger) {
            Ok(bound) => bound,
            Err(e) => {
                if !matches!(&e, HarnessError::Binding(BindingError::Cli(c)) if is_informational(c))
                {
                    report(&Logger::bootstrap(), "Failed to load base configuration", &e);
                }
                return Err(e);
            }
        };

    let config = bind_fields(&fields, &resolved)
        .map_err(HarnessError::from)
        .inspect_err(|e| report(&logger, "Failed to load service configuration", e))?;

    if let Err(e) = validation::validate(&config, |c, v| service.validate(c, v)) {
        logger.in_scope(|| {
            for violation in e.violations() {
                tracing::error!(
                    field = %violation.field,
                    rule = %violation.rule,
                    "{}",
                    violation.message
                );
            }
            tracing::error!(violations = e.len(), "Invalid service configuration");
        });
        return Err(e.into());
    }

    let unknown_env = EnvironmentAuditor::new(binder.registry()).audit(env, &logger);
    let snapshot = ConfigSnapshot::capture(&resolved);

    logger.in_scope(|| {
        tracing::info!(
            service = %service.name(),
            version = %service.version(),
            config = %snapshot.to_json(),
            "Starting service"
        );
    });

    Ok(Startup {
        global,
        config,
        logger,
        resolved,
        snapshot,
        unknown_env,
    })
}

fn bind_global<S, I, T, F>(
    service: &S,
    fields: &[Field<S::Config>],
    args: I,
    env: &HashMap<String, String>,
    build_logger: F,
) -> Result<(ConfigBinder, ResolvedConfig, GlobalConfig, Logger), HarnessError>
where
    S: Service,
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: FnOnce(&GlobalConfig) -> Result<Logger, HarnessError>,
{
    let binder = ConfigBinder::new(
        service.name(),
        service.version(),
        fields.iter().map(Field::decl),
    )?;
    let resolved = binder.bind(args, env)?;
    let global = GlobalConfig::from_resolved(&resolved)?;
    let logger = build_logger(&global)?;
    Ok((binder, resolved, global, logger))
}

fn report(logger: &Logger, message: &str, err: &HarnessError) {
    logger.in_scope(|| tracing::error!(error = %err, "{}", message));
}

fn is_informational(err: &clap::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
    )
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
