//! Process bootstrap: configuration, WAL-backed engine startup, admin account
//! seeding, and the background sweeper/compactor tasks.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::auth;
use crate::engine::Engine;
use crate::model::Role;
use crate::sweep;

const WAL_FILE_NAME: &str = "portal.wal";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub admin_user: String,
    pub admin_password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind: std::env::var("PARKD_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("PARKD_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(7070),
            data_dir: PathBuf::from(
                std::env::var("PARKD_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            admin_user: std::env::var("PARKD_ADMIN_USER").unwrap_or_else(|_| "admin".into()),
            admin_password: std::env::var("PARKD_ADMIN_PASSWORD")
                .unwrap_or_else(|_| "admin".into()),
            max_connections: std::env::var("PARKD_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(256),
            compact_threshold: std::env::var("PARKD_COMPACT_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1000),
            metrics_port: std::env::var("PARKD_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }
}

/// Open (or create) the portal's WAL, replay it, seed the admin account if it
/// doesn't exist yet, and start the sweeper and compactor.
pub async fn bootstrap(config: &Config) -> io::Result<Arc<Engine>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join(WAL_FILE_NAME);
    let engine = Arc::new(Engine::new(wal_path)?);

    if engine.find_user(&config.admin_user).is_none() {
        let hash = auth::hash_password(&config.admin_password)
            .map_err(|e| io::Error::other(format!("admin password hashing failed: {e}")))?;
        engine
            .register_user(&config.admin_user, hash, Role::Admin)
            .await
            .map_err(|e| io::Error::other(format!("admin seeding failed: {e}")))?;
        info!("seeded admin account '{}'", config.admin_user);
    }

    let sweeper_engine = engine.clone();
    tokio::spawn(async move {
        sweep::run_sweeper(sweeper_engine).await;
    });
    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        sweep::run_compactor(compactor_engine, threshold).await;
    });

    Ok(engine)
}
