//! TenantMux Server
//!
//! Runs the HTTP API and one broker consumer per tenant. On startup the
//! consumers of every stored tenant are restored; on Ctrl-C or SIGTERM the
//! HTTP listener stops first, then consumers drain within the configured
//! shutdown timeout, then broker channels and the connection are closed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tmx_api::{create_router, AppState};
use tmx_config::{AppConfig, DatabaseConfig, LoggingConfig};
use tmx_queue::BrokerClient;
use tmx_router::{ConsumerRegistry, ConsumerSettings, MessageService, StoreProcessor, TenantService};
use tmx_store::{MessageStore, PostgresStore, SqliteStore, TenantDirectory};

#[derive(Parser, Debug)]
#[command(name = "tmx-server")]
#[command(about = "TenantMux - per-tenant queues with live-resizable consumers")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short, env = "TMX_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Run the HTTP server and tenant consumers (default)
    Serve,
    /// Create the database schema and exit
    Migrate,
}

struct Stores {
    tenants: Arc<dyn TenantDirectory>,
    messages: Arc<dyn MessageStore>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => migrate(config).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn migrate(config: AppConfig) -> Result<()> {
    info!("Running schema bootstrap");
    connect_stores(&config.database).await?;
    info!("Schema is up to date");
    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting TenantMux server");

    // 1. Metrics recorder
    let metrics = install_metrics();

    // 2. Database
    let stores = connect_stores(&config.database).await?;

    // 3. Broker
    let client = Arc::new(
        BrokerClient::connect_amqp(&config.broker.url, config.broker.publisher_confirms)
            .await
            .context("failed to connect to broker")?,
    );

    // 4. Consumer orchestration
    let settings = ConsumerSettings {
        prefetch: config.broker.prefetch,
        retry_delay: config.consumer.retry_delay(),
        max_attempts: config.consumer.max_attempts,
    };
    let registry = Arc::new(ConsumerRegistry::new(
        client.clone(),
        Arc::new(StoreProcessor::new(stores.messages.clone())),
        settings,
    ));
    let tenants = Arc::new(TenantService::new(
        stores.tenants.clone(),
        stores.messages.clone(),
        registry.clone(),
        client.clone(),
    ));
    let messages = Arc::new(MessageService::new(
        stores.tenants.clone(),
        stores.messages.clone(),
        client.clone(),
    ));

    if config.consumer.restore_on_startup {
        let summary = tenants.restore_consumers().await?;
        if summary.failed > 0 {
            warn!(failed = summary.failed, "Some tenant consumers could not be restored");
        }
    } else {
        info!("Consumer restore disabled, existing tenants stay idle until touched");
    }

    // 5. HTTP API
    let app = create_router(AppState {
        tenants,
        messages,
        registry: registry.clone(),
        client: client.clone(),
        metrics,
    });

    let addr = config.server.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Drain
    info!("HTTP server stopped, draining tenant consumers");
    registry.shutdown(config.consumer.shutdown_timeout()).await;
    if let Err(e) = client.close_all().await {
        error!(error = %e, "Error closing broker connection");
    }

    info!("TenantMux server shutdown complete");
    Ok(())
}

async fn connect_stores(config: &DatabaseConfig) -> Result<Stores> {
    if config.url.starts_with("sqlite:") {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .context("failed to connect to SQLite")?;
        let store = Arc::new(SqliteStore::new(pool));
        store.init_schema().await?;
        info!("Using SQLite store");
        return Ok(Stores {
            tenants: store.clone(),
            messages: store,
        });
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
        .context("failed to connect to PostgreSQL")?;
    let store = Arc::new(PostgresStore::new(pool));
    store.init_schema().await?;
    info!("Using PostgreSQL store");
    Ok(Stores {
        tenants: store.clone(),
        messages: store,
    })
}

fn install_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics will be empty");
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received");
}
