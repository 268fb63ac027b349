use agency_core::{AgencyConfig, EndpointConfig};
use agency_service::{build_router, AppState};
use agency_storage::memory::InMemoryStorage;
use agency_storage::postgres::PostgresStorage;
use agency_storage::{LedgerStore, SubmissionStore};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "agencyd", version, about = "Agency data-collection REST service")]
struct Cli {
    /// Socket address to bind, e.g. 127.0.0.1:8080
    #[arg(long, default_value = "127.0.0.1:8080", env = "AGENCY_LISTEN")]
    listen: SocketAddr,
    /// Storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "AGENCY_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for submission and ledger persistence.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 10, env = "AGENCY_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Base URL of the external data-collection API.
    #[arg(long, env = "COLLECTOR_BASE_URL")]
    collector_base_url: String,
    /// API key for the data-collection API.
    #[arg(long, env = "COLLECTOR_API_KEY")]
    collector_api_key: String,
    /// Base URL of the core-banking payments API.
    #[arg(long, env = "PAYMENTS_BASE_URL")]
    payments_base_url: String,
    /// Basic-auth username for the payments API.
    #[arg(long, env = "PAYMENTS_USERNAME")]
    payments_username: String,
    /// Basic-auth password for the payments API.
    #[arg(long, env = "PAYMENTS_PASSWORD")]
    payments_password: String,
}

async fn resolve_storage(
    cli: &Cli,
) -> anyhow::Result<(Arc<dyn LedgerStore>, Arc<dyn SubmissionStore>, &'static str)> {
    let use_postgres = match cli.storage {
        StorageMode::Memory => false,
        StorageMode::Postgres => true,
        StorageMode::Auto => cli.database_url.is_some(),
    };

    if use_postgres {
        let database_url = cli
            .database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL"))?;
        let store = Arc::new(
            PostgresStorage::connect_with_options(database_url, cli.pg_max_connections, 5).await?,
        );
        Ok((
            store.clone() as Arc<dyn LedgerStore>,
            store as Arc<dyn SubmissionStore>,
            "postgres",
        ))
    } else {
        let store = Arc::new(InMemoryStorage::new());
        Ok((
            store.clone() as Arc<dyn LedgerStore>,
            store as Arc<dyn SubmissionStore>,
            "memory",
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "agency_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();

    let config = AgencyConfig::new(
        EndpointConfig::collector(&cli.collector_base_url, &cli.collector_api_key),
        EndpointConfig::payments(
            &cli.payments_base_url,
            &cli.payments_username,
            &cli.payments_password,
        ),
    );

    let (ledger, records, storage_backend) = resolve_storage(&cli).await?;
    let state = AppState::new(&config, ledger, records, storage_backend)
        .map_err(|e| anyhow::anyhow!("failed to build gateways: {e}"))?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(
        storage_backend,
        "agency-service listening on {}",
        listener.local_addr()?
    );

    axum::serve(listener, app).await?;
    Ok(())
}
