use chrono::Utc;
use clap::{Parser, Subcommand};
use erasure_core::{compute_challenge_response, digests_match, DedupStore, NotificationId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use erasure::{
    build_router, build_service, open_store, AppState, AxumAdapter, EndpointRequirement,
    ErasureError, ErasureResult, GatewayAdapter, GatewayEvent, GatewayResponse, RootConfig,
    Service,
};

/// Erasure: marketplace account-deletion compliance endpoint
///
/// Answers the platform's ownership challenge and accepts account-deletion
/// notifications, handing them to the deletion pipeline in the background.
#[derive(Parser, Debug)]
#[command(name = "erasure", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP server
    Serve {
        /// Bind address (overrides [server] bind)
        #[arg(long)]
        bind: Option<String>,

        /// Port (overrides [server] port)
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Handle one API-gateway proxy event and print the result
    Invoke {
        /// Read the event from a file instead of stdin
        #[arg(long)]
        event: Option<PathBuf>,
    },

    /// Compute a challenge response offline
    Digest {
        /// The challenge code sent by the platform
        code: String,

        /// Verification token (defaults to the configured one)
        #[arg(long)]
        token: Option<String>,

        /// Endpoint URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,

        /// Compare against a digest the endpoint returned
        #[arg(long)]
        expect: Option<String>,
    },

    /// Show dedup store counts, or one record
    Status {
        /// Notification id to look up
        #[arg(long)]
        id: Option<String>,
    },

    /// Delete dedup records older than the retention window
    Prune {
        /// Override the configured retention in days
        #[arg(long)]
        older_than_days: Option<u32>,
    },

    /// Validate the configuration and print a summary
    CheckConfig,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("erasure=debug,erasure_core=debug,erasure_notify=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("erasure=info,erasure_core=info,erasure_notify=info")
        })
    };

    // stdout is reserved for command output (the gateway result on `invoke`).
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> ErasureResult<RootConfig> {
    let mut config = match path {
        Some(p) => RootConfig::load(p)?,
        None => RootConfig::load(&RootConfig::default_config_path())?,
    };
    config.apply_env();
    Ok(config)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = run(cli).await;
    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> ErasureResult<()> {
    match cli.command {
        Commands::Serve { bind, port } => cmd_serve(cli.config.as_ref(), bind, port).await,
        Commands::Invoke { event } => cmd_invoke(cli.config.as_ref(), event).await,
        Commands::Digest {
            code,
            token,
            url,
            expect,
        } => cmd_digest(cli.config.as_ref(), &code, token, url, expect),
        Commands::Status { id } => cmd_status(cli.config.as_ref(), id).await,
        Commands::Prune { older_than_days } => {
            cmd_prune(cli.config.as_ref(), older_than_days).await
        }
        Commands::CheckConfig => cmd_check_config(cli.config.as_ref()),
    }
}

async fn cmd_serve(
    config_path: Option<&PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
) -> ErasureResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let Service {
        handler, worker, ..
    } = build_service(&config, EndpointRequirement::Required)?;

    let cancel = CancellationToken::new();
    let worker = tokio::spawn(worker.run(cancel.clone()));

    let state = Arc::new(AppState {
        handler,
        adapter: AxumAdapter {
            trust_forwarded_host: config.server.trust_forwarded_host,
        },
    });
    let router = build_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "compliance endpoint listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, draining deletion queue");
    cancel.cancel();
    let report = worker
        .await
        .map_err(|e| ErasureError::Internal(format!("deletion worker panicked: {}", e)))?;
    info!(
        processed = report.processed,
        failed = report.failed,
        skipped = report.skipped,
        "shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
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
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn cmd_invoke(config_path: Option<&PathBuf>, event: Option<PathBuf>) -> ErasureResult<()> {
    let config = load_config(config_path)?;

    let raw = match event {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut raw = String::new();
            tokio::io::stdin().read_to_string(&mut raw).await?;
            raw
        }
    };

    let Service {
        handler,
        worker,
        drain_timeout,
        ..
    } = build_service(&config, EndpointRequirement::Optional)?;

    let cancel = CancellationToken::new();
    let mut worker = tokio::spawn(worker.run(cancel.clone()));

    let response = match serde_json::from_str::<GatewayEvent>(&raw) {
        Ok(event) => GatewayAdapter.dispatch(&handler, event).await,
        Err(e) => {
            warn!(error = %e, "gateway event is not valid JSON");
            GatewayResponse::bad_request()
        }
    };
    println!("{}", serde_json::to_string(&response)?);

    // Dropping the handler closes the queue; the worker finishes what is queued.
    drop(handler);
    let grace = drain_timeout + Duration::from_secs(1);
    match tokio::time::timeout(grace, &mut worker).await {
        Ok(Ok(report)) => info!(
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            "deletion queue drained"
        ),
        Ok(Err(e)) => error!(error = %e, "deletion worker panicked"),
        Err(_) => {
            cancel.cancel();
            error!(
                grace_secs = grace.as_secs(),
                "exiting with deletion jobs still in flight"
            );
        }
    }
    Ok(())
}

fn cmd_digest(
    config_path: Option<&PathBuf>,
    code: &str,
    token: Option<String>,
    url: Option<String>,
    expect: Option<String>,
) -> ErasureResult<()> {
    let config = load_config(config_path)?;
    let token = token
        .or(config.endpoint.verification_token)
        .ok_or_else(|| ErasureError::Config("no verification token given or configured".into()))?;
    let url = url
        .or(config.endpoint.endpoint_url)
        .ok_or_else(|| ErasureError::Config("no endpoint URL given or configured".into()))?;

    let digest = compute_challenge_response(code, &token, &url);
    println!("{}", serde_json::json!({ "challengeResponse": digest }));

    if let Some(expected) = expect {
        if digests_match(&digest, expected.trim()) {
            println!("match");
        } else {
            return Err(ErasureError::Internal(
                "digest does not match the expected value".into(),
            ));
        }
    }
    Ok(())
}

async fn cmd_status(config_path: Option<&PathBuf>, id: Option<String>) -> ErasureResult<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    match id {
        Some(id) => {
            let id = NotificationId::new(id)?;
            match store.get(&id).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("No record for {}", id),
            }
        }
        None => {
            let stats = store.stats().await?;
            println!("Dedup Store:");
            println!("  Backend:   {:?}", config.store.backend);
            println!("  Path:      {}", config.store.path.display());
            println!("  Pending:   {}", stats.pending);
            println!("  Processed: {}", stats.processed);
            println!("  Failed:    {}", stats.failed);
            println!("  Total:     {}", stats.total());
        }
    }
    Ok(())
}

async fn cmd_prune(config_path: Option<&PathBuf>, older_than_days: Option<u32>) -> ErasureResult<()> {
    let config = load_config(config_path)?;
    let days = older_than_days.unwrap_or(config.store.retention_days);
    if days == 0 {
        return Err(ErasureError::Config("retention must be at least one day".into()));
    }

    let store = open_store(&config)?;
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
    let pruned = store.prune_expired(cutoff).await?;
    info!(pruned, days, "pruned dedup records");
    println!("Pruned {} record(s) older than {} day(s).", pruned, days);
    Ok(())
}

fn cmd_check_config(config_path: Option<&PathBuf>) -> ErasureResult<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    let endpoint = config.endpoint_configuration()?;

    println!("Configuration OK.");
    println!("  Endpoint URL:   {}", endpoint.canonical_endpoint_url());
    println!(
        "  Token:          {} characters",
        endpoint.verification_token().len()
    );
    println!("  Store:          {:?} ({})", config.store.backend, config.store.path.display());
    println!(
        "  Pipeline:       {}",
        config.pipeline.url.as_deref().unwrap_or("log only")
    );
    println!(
        "  Signed:         {}",
        if config.pipeline.secret.is_some() { "yes" } else { "no" }
    );
    println!("  URL source:     {:?}", config.handler.url_source);
    println!("  Malformed body: {:?}", config.handler.malformed_policy);
    Ok(())
}
