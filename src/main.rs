use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keygate::api::{self, AppState};
use keygate::cli::{self, KeyCommands};
use keygate::clock::{Clock, SystemClock};
use keygate::config::{self, Config, StoreBackend};
use keygate::errors::KeyError;
use keygate::jobs::sweeper::ExpirySweeper;
use keygate::models::key::{IssueRequest, KeyStatus, EXPIRY_FORMAT};
use keygate::notification::webhook::WebhookNotifier;
use keygate::notification::Notifier;
use keygate::store::memory::MemoryStore;
use keygate::store::postgres::PgStore;
use keygate::store::KeyStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse arguments before touching configuration so --help and --version
    // work without a usable environment.
    let args = cli::Cli::parse();

    // Export spans over OTLP only when a collector endpoint is configured;
    // otherwise logging goes to stdout alone.
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "keygate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "keygate=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Key { command }) => {
            let store = open_store(&cfg).await?;
            handle_key_command(command, &cfg, store).await
        }
        Some(cli::Commands::Sweep) => {
            let store = open_store(&cfg).await?;
            let sweeper = build_sweeper(&cfg, store)?;
            let report = sweeper.run_once().await?;
            println!("Removed {} expired key(s).", report.removed);
            Ok(())
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn KeyStore>> {
    match cfg.store {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Arc::new(db))
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory key store; keys will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_sweeper(cfg: &Config, store: Arc<dyn KeyStore>) -> anyhow::Result<ExpirySweeper> {
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new(
        cfg.notify_webhook_url.clone(),
        cfg.notify_webhook_secret.clone(),
    )?);
    Ok(ExpirySweeper::new(store, notifier, Arc::new(SystemClock))
        .with_interval(cfg.sweep_interval)
        .with_notify_on_empty(cfg.sweep_notify_empty))
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let store = open_store(&cfg).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let sweeper = build_sweeper(&cfg, store.clone())?;

    if !cfg.hwid_binding {
        tracing::warn!("hardware binding is disabled; keys are accepted from any device");
    }

    let state = Arc::new(AppState::new(cfg, store, clock)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_handle = sweeper
        .with_metrics(state.metrics.clone())
        .spawn(shutdown_rx.clone());

    let evict_handle = {
        let state = state.clone();
        let mut shutdown = shutdown_rx;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let evicted = state.limiter.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted idle rate limit windows");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("keygate listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutting down background tasks");
    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper_handle.await {
        tracing::error!("expiry sweeper task failed: {}", e);
    }
    if let Err(e) = evict_handle.await {
        tracing::error!("rate limit eviction task failed: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}

async fn handle_key_command(
    cmd: KeyCommands,
    cfg: &Config,
    store: Arc<dyn KeyStore>,
) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(cfg.clone(), store, clock)?;

    match cmd {
        KeyCommands::Generate {
            days,
            hours,
            minutes,
            length,
        } => {
            let record = state
                .issuer
                .issue(IssueRequest {
                    days,
                    hours,
                    minutes,
                    length,
                })
                .await?;
            println!(
                "Generated Key: {}\nExpires On: {} (in {}d {}h {}m)",
                record.token,
                record.expires_at.format(EXPIRY_FORMAT),
                days,
                hours,
                minutes
            );
        }
        KeyCommands::Remove { key } => match state.admin.revoke(&key).await {
            Ok(()) => println!("Key {} removed successfully.", key),
            Err(KeyError::NotFound) => println!("Key {} not found.", key),
            Err(e) => return Err(e.into()),
        },
        KeyCommands::Check { key } => match state.admin.check_status(&key).await? {
            KeyStatus::Valid { expires_at } => println!(
                "Key {} is valid. Expires on: {}",
                key,
                expires_at.format(EXPIRY_FORMAT)
            ),
            KeyStatus::Expired { expires_at } => println!(
                "Key {} has expired. Expired on: {}",
                key,
                expires_at.format(EXPIRY_FORMAT)
            ),
            KeyStatus::NotFound => println!("Key {} not found in the database.", key),
        },
        KeyCommands::List => {
            println!("{}", state.admin.list().await?);
        }
        KeyCommands::ResetHwid { key } => match state.admin.reset_binding(&key).await {
            Ok(()) => println!("HWID for key {} has been reset.", key),
            Err(KeyError::NotFound) => println!("Key {} not found.", key),
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}
