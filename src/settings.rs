//! Environment-driven configuration.
//!
//! Every setting has a default suitable for local development; production
//! deployments override via `GONKA_*` environment variables. Settings are
//! read once at startup — there is no hot-reload for these (the model
//! catalog, which *is* hot-reloaded, lives in its own file; see
//! [`crate::registry`]).

use std::{path::PathBuf, time::Duration};

use anyhow::Context;

/// Gateway settings, collected from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind address host (`GONKA_GATEWAY_HOST`, default `0.0.0.0`).
    pub gateway_host: String,
    /// Bind port (`GONKA_GATEWAY_PORT`, default `9000`).
    pub gateway_port: u16,
    /// Path to the model catalog file (`GONKA_MODELS_CONFIG`).
    pub models_config: PathBuf,
    /// Path to the credential persistence file (`GONKA_API_KEYS_FILE`).
    /// `None` disables persistence — keys live in memory only.
    pub api_keys_file: Option<PathBuf>,
    /// Bearer token gating the admin API (`GONKA_ADMIN_API_KEY`).
    /// `None` leaves the admin surface open (dev mode).
    pub admin_api_key: Option<String>,
    /// Default requests-per-minute for newly minted keys (`GONKA_DEFAULT_RPM`).
    pub default_rpm: u32,
    /// Default tokens-per-minute for newly minted keys (`GONKA_DEFAULT_TPM`).
    pub default_tpm: i64,
    /// Session idle time-to-live (`GONKA_SESSION_TTL`, seconds).
    pub session_ttl: Duration,
    /// Maximum messages retained per session (`GONKA_SESSION_MAX_HISTORY`).
    pub session_max_history: usize,
    /// Parent directory for persisted state (`GONKA_DATA_DIR`).
    pub data_dir: PathBuf,
}

impl Settings {
    /// Read all settings from the environment, applying defaults.
    ///
    /// Fails only on unparseable numeric values — a misconfiguration we want
    /// surfaced at startup, not at request time.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            gateway_host: env_or("GONKA_GATEWAY_HOST", defaults::HOST),
            gateway_port: parsed("GONKA_GATEWAY_PORT", defaults::PORT)?,
            models_config: PathBuf::from(env_or("GONKA_MODELS_CONFIG", defaults::MODELS_CONFIG)),
            api_keys_file: std::env::var("GONKA_API_KEYS_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            admin_api_key: std::env::var("GONKA_ADMIN_API_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            default_rpm: parsed("GONKA_DEFAULT_RPM", defaults::RPM)?,
            default_tpm: parsed("GONKA_DEFAULT_TPM", defaults::TPM)?,
            session_ttl: Duration::from_secs(parsed("GONKA_SESSION_TTL", defaults::SESSION_TTL_SECS)?),
            session_max_history: parsed("GONKA_SESSION_MAX_HISTORY", defaults::SESSION_MAX_HISTORY)?,
            data_dir: PathBuf::from(env_or("GONKA_DATA_DIR", defaults::DATA_DIR)),
        })
    }

    /// Path of the usage ledger database under the data directory.
    pub fn usage_db_path(&self) -> PathBuf {
        self.data_dir.join("usage.db")
    }
}

fn env_or(var: &str, default: &str) -> String {
    std::env::var(var).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string())
}

fn parsed<T>(var: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(var) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .with_context(|| format!("parsing {var}={raw}")),
        _ => Ok(default),
    }
}

mod defaults {
    pub const HOST: &str = "0.0.0.0";
    pub const PORT: u16 = 9000;
    pub const MODELS_CONFIG: &str = "config/models.toml";
    pub const RPM: u32 = 60;
    pub const TPM: i64 = 100_000;
    pub const SESSION_TTL_SECS: u64 = 3600;
    pub const SESSION_MAX_HISTORY: usize = 100;
    pub const DATA_DIR: &str = "data";
}
