//! API key authentication.
//!
//! Bearer tokens are validated against an in-memory map of [`Principal`]
//! records, optionally persisted to a JSON file (`{"keys": [...]}`). Keys
//! are never deleted in-process — revocation flips the `active` flag so the
//! record (and its audit trail in the ledger) survives.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::RwLock,
};

use anyhow::Context;
use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// An authenticated identity with its quota limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub key: String,
    pub owner: String,
    #[serde(default = "defaults::tier")]
    pub tier: String,
    #[serde(default = "defaults::rpm_limit")]
    pub rpm_limit: u32,
    #[serde(default = "defaults::tpm_limit")]
    pub tpm_limit: i64,
    #[serde(default = "defaults::created_at")]
    pub created_at: f64,
    #[serde(default = "defaults::active")]
    pub active: bool,
}

/// Masked listing entry — the middle of the key is never exposed.
#[derive(Debug, Serialize)]
pub struct MaskedPrincipal {
    pub key: String,
    pub owner: String,
    pub tier: String,
    pub rpm_limit: u32,
    pub tpm_limit: i64,
    pub active: bool,
    pub created_at: f64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KeysFile {
    #[serde(default)]
    keys: Vec<Principal>,
}

/// In-memory credential map with optional JSON file persistence.
///
/// Read-mostly: `validate` takes the read lock; admin mutations take the
/// write lock and rewrite the file before returning.
pub struct CredentialStore {
    keys: RwLock<HashMap<String, Principal>>,
    path: Option<PathBuf>,
}

impl CredentialStore {
    /// Build a store backed by `path`. A missing file yields an empty store;
    /// an unreadable or malformed file is a startup error.
    pub fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut keys = HashMap::new();
        if let Some(path) = path.as_deref().filter(|p| p.exists()) {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let file: KeysFile =
                serde_json::from_str(&content).context("parsing API keys file")?;
            for principal in file.keys {
                keys.insert(principal.key.clone(), principal);
            }
            tracing::info!(count = keys.len(), path = %path.display(), "loaded API keys");
        }
        Ok(Self { keys: RwLock::new(keys), path })
    }

    /// Validate a bearer key. Returns the principal only when known and
    /// active.
    pub fn validate(&self, key: &str) -> Option<Principal> {
        let keys = self.keys.read().expect("credential map lock poisoned");
        keys.get(key).filter(|p| p.active).cloned()
    }

    /// Create or replace a key. Persists before returning.
    pub fn add(
        &self,
        key: &str,
        owner: &str,
        tier: &str,
        rpm_limit: u32,
        tpm_limit: i64,
    ) -> anyhow::Result<Principal> {
        let principal = Principal {
            key: key.to_string(),
            owner: owner.to_string(),
            tier: tier.to_string(),
            rpm_limit,
            tpm_limit,
            created_at: defaults::created_at(),
            active: true,
        };
        {
            let mut keys = self.keys.write().expect("credential map lock poisoned");
            keys.insert(key.to_string(), principal.clone());
        }
        self.save()?;
        Ok(principal)
    }

    /// Mark a key inactive. Returns whether the key existed. Persists.
    pub fn revoke(&self, key: &str) -> anyhow::Result<bool> {
        let revoked = {
            let mut keys = self.keys.write().expect("credential map lock poisoned");
            match keys.get_mut(key) {
                Some(principal) => {
                    principal.active = false;
                    true
                }
                None => false,
            }
        };
        if revoked {
            self.save()?;
        }
        Ok(revoked)
    }

    /// Masked records for the admin listing.
    pub fn list_masked(&self) -> Vec<MaskedPrincipal> {
        let keys = self.keys.read().expect("credential map lock poisoned");
        keys.values()
            .map(|p| MaskedPrincipal {
                key: mask_key(&p.key),
                owner: p.owner.clone(),
                tier: p.tier.clone(),
                rpm_limit: p.rpm_limit,
                tpm_limit: p.tpm_limit,
                active: p.active,
                created_at: p.created_at,
            })
            .collect()
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().expect("credential map lock poisoned").len()
    }

    fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let file = {
            let keys = self.keys.read().expect("credential map lock poisoned");
            KeysFile { keys: keys.values().cloned().collect() }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&file).context("serializing API keys")?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

/// Show the first 8 and last 4 characters; keys too short to mask safely
/// are fully redacted.
fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "...".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Strip the bearer key out of the `Authorization` header.
pub fn extract_bearer(headers: &HeaderMap) -> Result<&str, GatewayError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .filter(|key| !key.is_empty())
        .ok_or(GatewayError::InvalidApiKey)
}

/// Extract and validate the bearer key in one step.
pub fn authenticate(
    store: &CredentialStore,
    headers: &HeaderMap,
) -> Result<(String, Principal), GatewayError> {
    let key = extract_bearer(headers)?;
    let principal = store.validate(key).ok_or(GatewayError::InvalidApiKey)?;
    Ok((key.to_string(), principal))
}

mod defaults {
    pub fn tier() -> String {
        "standard".into()
    }
    pub fn rpm_limit() -> u32 {
        60
    }
    pub fn tpm_limit() -> i64 {
        100_000
    }
    pub fn created_at() -> f64 {
        chrono::Utc::now().timestamp_millis() as f64 / 1000.0
    }
    pub fn active() -> bool {
        true
    }
}
