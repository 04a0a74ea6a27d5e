use std::net::IpAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::{StoreBackend, TurnstileConfig};
use turnstile::gate::{GateDecision, GateRequest, RateLimitGate};
use turnstile::identity::{ClientIdentityResolver, RequestMetadata};
use turnstile::ratelimit::{Principal, ThrottleEngine, ThrottleResult};
use turnstile::store::{ConfiguredStore, MeshStore};

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Fixed-window request admission control")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run raw throttle checks against the configured store and print each decision
    Check {
        /// Throttle key
        #[arg(long)]
        key: String,
        /// Calls allowed per window (non-positive disables throttling)
        #[arg(long, allow_negative_numbers = true)]
        limit: i64,
        /// Window length in seconds (non-positive disables throttling)
        #[arg(long, allow_negative_numbers = true)]
        window: i64,
        /// Number of calls to make
        #[arg(long, default_value_t = 1)]
        calls: u32,
    },
    /// Run calls through the configured gate and print each decision
    Admit {
        /// Direct peer address
        #[arg(long)]
        peer: Option<IpAddr>,
        /// Raw X-Forwarded-For value
        #[arg(long)]
        forwarded_for: Option<String>,
        /// Authenticated user id; the call is anonymous when omitted
        #[arg(long)]
        user: Option<String>,
        /// Named operation to check instead of the tier limit
        #[arg(long)]
        operation: Option<String>,
        /// Sub-resource scope for the operation
        #[arg(long, requires = "operation")]
        scope: Option<String>,
        /// Number of calls to make
        #[arg(long, default_value_t = 1)]
        calls: u32,
    },
    /// Show which actor a call would be counted against
    Resolve {
        /// Direct peer address
        #[arg(long)]
        peer: Option<IpAddr>,
        /// Raw X-Forwarded-For value
        #[arg(long)]
        forwarded_for: Option<String>,
        /// Ignore the forwarded header regardless of configuration
        #[arg(long)]
        no_trust: bool,
    },
    /// Run a mesh counter store node until interrupted
    Node,
}

#[derive(Debug, Serialize)]
struct CheckLine<'a> {
    call: u32,
    key: &'a str,
    #[serde(flatten)]
    result: ThrottleResult,
}

#[derive(Debug, Serialize)]
struct AdmitLine<'a> {
    call: u32,
    actor: &'a str,
    proceed: bool,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(flatten)]
    result: ThrottleResult,
}

impl<'a> AdmitLine<'a> {
    fn new(call: u32, actor: &'a str, decision: &GateDecision) -> Self {
        let rejection = decision.rejection();
        Self {
            call,
            actor,
            proceed: decision.proceed,
            status: rejection.map_or(200, |r| r.status().as_u16()),
            retry_after: rejection.and_then(|r| r.retry_after()),
            result: decision.result,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so command output on stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Check {
            key,
            limit,
            window,
            calls,
        } => run_check(&config, &key, limit, window, calls).await,
        Command::Admit {
            peer,
            forwarded_for,
            user,
            operation,
            scope,
            calls,
        } => {
            let mut metadata = RequestMetadata::new(peer);
            if let Some(value) = forwarded_for.as_deref() {
                metadata = metadata.with_forwarded_for(value);
            }
            let request = match user.as_deref() {
                Some(user) => GateRequest::authenticated(metadata, user),
                None => GateRequest::anonymous(metadata),
            };
            run_admit(&config, &request, operation.as_deref(), scope.as_deref(), calls).await
        }
        Command::Resolve {
            peer,
            forwarded_for,
            no_trust,
        } => {
            let mut identity = config.identity.clone();
            if no_trust {
                identity.trust_forwarded_header = false;
            }
            let mut metadata = RequestMetadata::new(peer);
            if let Some(value) = forwarded_for.as_deref() {
                metadata = metadata.with_forwarded_for(value);
            }
            println!("{}", ClientIdentityResolver::new(identity).resolve(&metadata));
            Ok(())
        }
        Command::Node => run_node(config).await,
    }
}

async fn run_check(
    config: &TurnstileConfig,
    key: &str,
    limit: i64,
    window: i64,
    calls: u32,
) -> anyhow::Result<()> {
    let store = ConfiguredStore::open(&config.store, Arc::new(SystemClock)).await?;
    let engine = build_engine(config, &store);

    for call in 1..=calls {
        let result = engine.check(key, limit, window).await;
        println!("{}", serde_json::to_string(&CheckLine { call, key, result })?);
    }

    info!(stats = ?engine.stats(), "Checks complete");
    drop(engine);
    store.close().await?;
    Ok(())
}

async fn run_admit(
    config: &TurnstileConfig,
    request: &GateRequest,
    operation: Option<&str>,
    scope: Option<&str>,
    calls: u32,
) -> anyhow::Result<()> {
    let store = ConfiguredStore::open(&config.store, Arc::new(SystemClock)).await?;
    let gate = RateLimitGate::from_config(config, Arc::new(build_engine(config, &store)));

    // Operation limits follow the user when there is one, else the address
    let actor = match &request.principal {
        Principal::Authenticated(user) if operation.is_some() => user.clone(),
        _ => gate.actor_for(request),
    };

    for call in 1..=calls {
        let decision = match operation {
            Some(name) => gate.admit_named(name, &actor, scope).await,
            None => gate.admit(request).await,
        };
        println!("{}", serde_json::to_string(&AdmitLine::new(call, &actor, &decision))?);
    }

    info!(stats = ?gate.engine().stats(), "Admission checks complete");
    drop(gate);
    store.close().await?;
    Ok(())
}

fn build_engine(config: &TurnstileConfig, store: &ConfiguredStore) -> ThrottleEngine {
    ThrottleEngine::new(store.counter_store()).with_store_timeout(config.store.timeout())
}

async fn run_node(config: TurnstileConfig) -> anyhow::Result<()> {
    if config.store.backend != StoreBackend::Mesh {
        info!("Store backend is not mesh in configuration, starting a mesh node anyway");
    }

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    let store = MeshStore::start(config.store.mesh, Arc::new(SystemClock)).await?;
    info!(
        node_id = %store.node_id(),
        live_nodes = store.live_node_count().await,
        "Mesh store node running"
    );

    shutdown_signal().await;

    store.shutdown().await?;
    info!("Mesh store node stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
