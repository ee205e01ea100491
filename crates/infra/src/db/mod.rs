use std::sync::Arc;
use std::time::Duration;

use procstats_domain::ports::BoxFuture;
use procstats_domain::ports::db::{DbAdapter, DbError};
use surrealdb::{
    Surreal,
    engine::remote::ws::{Client, Ws},
    opt::auth::Root,
};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::AppConfig;

/// Tables and indexes owned by the statistics engine. `processed_document`
/// belongs to the processing pipeline; only its lookup index is declared here.
pub const STATS_SCHEMA: &str = "
DEFINE TABLE IF NOT EXISTS daily_counter SCHEMALESS;
DEFINE INDEX IF NOT EXISTS daily_counter_city_date ON TABLE daily_counter FIELDS city_code, date UNIQUE;
DEFINE INDEX IF NOT EXISTS daily_counter_date ON TABLE daily_counter FIELDS date;
DEFINE TABLE IF NOT EXISTS hourly_counter SCHEMALESS;
DEFINE INDEX IF NOT EXISTS hourly_counter_city_hour ON TABLE hourly_counter FIELDS city_code, hour UNIQUE;
DEFINE TABLE IF NOT EXISTS stats_reconciliation SCHEMALESS;
DEFINE INDEX IF NOT EXISTS stats_reconciliation_city_date ON TABLE stats_reconciliation FIELDS city_code, date;
DEFINE INDEX IF NOT EXISTS stats_reconciliation_executed_at ON TABLE stats_reconciliation FIELDS executed_at;
DEFINE INDEX IF NOT EXISTS processed_document_city_time ON TABLE processed_document FIELDS city_code, processed_at;
";

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }
}

/// Opens one authenticated session shared by every Surreal repository.
pub async fn connect(db_config: &DbConfig) -> anyhow::Result<Arc<Surreal<Client>>> {
    let db = Surreal::<Client>::init();
    db.connect::<Ws>(&db_config.endpoint).await?;
    db.signin(Root {
        username: db_config.username.clone(),
        password: db_config.password.clone(),
    })
    .await?;
    db.use_ns(&db_config.namespace)
        .use_db(&db_config.database)
        .await?;
    Ok(Arc::new(db))
}

pub async fn apply_schema(client: &Surreal<Client>) -> anyhow::Result<()> {
    client.query(STATS_SCHEMA).await?.check()?;
    tracing::info!("stats schema applied");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SurrealAdapter {
    config: DbConfig,
}

impl SurrealAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

impl DbAdapter for SurrealAdapter {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move {
            let address = parse_socket_address(&self.config.endpoint)?;
            let connect = timeout(Duration::from_secs(2), TcpStream::connect(address))
                .await
                .map_err(|_| {
                    DbError::Unavailable("surreal endpoint connect timed out".to_string())
                })?;
            connect.map_err(|err| {
                DbError::Unavailable(format!("surreal endpoint connect failed: {err}"))
            })?;

            tracing::debug!(
                endpoint = %self.config.endpoint,
                namespace = %self.config.namespace,
                database = %self.config.database,
                "surreal health check succeeded"
            );
            Ok(())
        })
    }
}

/// Backend used when counters live in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdapter;

impl DbAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async { Ok(()) })
    }
}

fn parse_socket_address(endpoint: &str) -> Result<String, DbError> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&normalized).map_err(|err| {
        DbError::Unavailable(format!("invalid surreal endpoint '{endpoint}': {err}"))
    })?;

    let host = parsed.host_str().ok_or_else(|| {
        DbError::Unavailable(format!("missing surreal host in endpoint '{endpoint}'"))
    })?;
    let port = parsed.port().unwrap_or(match parsed.scheme() {
        "wss" | "https" => 443,
        _ => 8000,
    });
    Ok(format!("{host}:{port}"))
}
