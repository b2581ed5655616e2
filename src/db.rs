//! Database connection management
//!
//! Builds the connection pool and hands out a migration backend bound to a
//! single pooled connection.

use crate::config::{DatabaseConfig, SslMode};
use crate::error::{MigrateError, MigrateResult};
use crate::migration::PostgresBackend;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{debug, info};

/// Create a connection pool with given configuration
pub fn create_pool(config: &DatabaseConfig) -> MigrateResult<Pool> {
    let mut cfg = Config::new();
    cfg.host = Some(config.host.clone());
    cfg.port = Some(config.port);
    cfg.user = Some(config.user.clone());
    cfg.password = config.password.clone();
    cfg.dbname = Some(config.database.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

    match config.ssl_mode {
        SslMode::Require => {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

            cfg.create_pool(Some(Runtime::Tokio1), tls)
                .map_err(|e| MigrateError::Config(format!("Failed to create TLS pool: {}", e)))
        }
        SslMode::Disable => cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| MigrateError::Config(format!("Failed to create pool: {}", e))),
    }
}

/// Open a verified connection and wrap it as a migration backend
pub async fn connect(config: &DatabaseConfig) -> MigrateResult<PostgresBackend> {
    let pool = create_pool(config)?;

    let client = pool.get().await?;
    client.query_one("SELECT 1", &[]).await?;

    info!(
        "Connected to {} (TLS: {})",
        config.display_target(),
        config.ssl_mode == SslMode::Require
    );
    debug!("Pool size limit {}", config.max_pool_size);

    Ok(PostgresBackend::new(client))
}
