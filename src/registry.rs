//! Model catalog loading and the registry of routable backends.
//!
//! The catalog is a declarative TOML file: an ordered `[[models]]` array
//! mapping public model names to upstream backends, plus a `[tiering]`
//! section consumed by [`crate::tiering`]. It is loaded at startup and
//! re-loaded either explicitly (admin API) or by the mtime watcher; a load
//! failure always leaves the live registry untouched.
//!
//! # Example
//! ```toml
//! [[models]]
//! name        = "llama-3-8b"
//! model_id    = "meta-llama/Meta-Llama-3-8B-Instruct"
//! backend_url = "http://localhost:8000"
//!
//! [tiering]
//! default_model = "llama-3-8b"
//! ```

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{
    error::GatewayError,
    tiering::{TieringConfig, TieringResolver, TieringSection},
};

/// A routable upstream backend, resolved from a public model name.
#[derive(Debug, Clone, Serialize)]
pub struct ModelBackend {
    /// Public name clients request.
    pub name: String,
    pub display_name: String,
    pub provider: String,
    /// Identifier the upstream expects in its request body.
    pub model_id: String,
    /// Informational tier label.
    pub tier: String,
    pub backend_url: String,
    pub capabilities: Vec<String>,
    pub context_length: i64,
    pub pricing: HashMap<String, f64>,
}

/// Raw `[[models]]` entry as written in the catalog file.
#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default = "defaults::provider")]
    provider: String,
    #[serde(default)]
    model_id: Option<String>,
    #[serde(default = "defaults::tier")]
    tier: String,
    backend_url: String,
    #[serde(default = "defaults::capabilities")]
    capabilities: Vec<String>,
    #[serde(default = "defaults::context_length")]
    context_length: i64,
    #[serde(default)]
    pricing: HashMap<String, f64>,
}

impl ModelEntry {
    fn into_backend(self) -> ModelBackend {
        ModelBackend {
            display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
            model_id: self.model_id.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            provider: self.provider,
            tier: self.tier,
            backend_url: self.backend_url,
            capabilities: self.capabilities,
            context_length: self.context_length,
            pricing: self.pricing,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(default)]
    tiering: TieringSection,
}

/// A parsed and validated catalog: models in registration order plus the
/// compiled tiering config.
pub struct Catalog {
    pub models: Vec<ModelBackend>,
    pub tiering: TieringConfig,
}

impl Catalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: CatalogFile = toml::from_str(&content).context("parsing model catalog TOML")?;
        Self::from_file(file)
    }

    fn from_file(file: CatalogFile) -> anyhow::Result<Self> {
        let models: Vec<ModelBackend> =
            file.models.into_iter().map(ModelEntry::into_backend).collect();

        let mut seen = HashSet::new();
        for model in &models {
            anyhow::ensure!(!model.name.is_empty(), "model entry with empty `name`");
            anyhow::ensure!(
                seen.insert(model.name.as_str()),
                "duplicate model name `{}`",
                model.name
            );
            anyhow::ensure!(
                !model.backend_url.is_empty(),
                "model `{}` has an empty `backend_url`",
                model.name
            );
        }

        // Every configured tier target must name a known model (or be empty).
        for (label, target) in [
            ("classification_model", &file.tiering.classification_model),
            ("reasoning_model", &file.tiering.reasoning_model),
            ("default_model", &file.tiering.default_model),
        ] {
            anyhow::ensure!(
                target.is_empty() || seen.contains(target.as_str()),
                "tiering `{label}` references unknown model `{target}`"
            );
        }

        let tiering = TieringConfig::compile(&file.tiering)?;
        Ok(Self { models, tiering })
    }
}

/// Live registry of routable models.
///
/// The lock is held only for the duration of `Arc::clone`, so reads never
/// contend with a reload in any meaningful way; reloads swap the whole
/// snapshot atomically.
pub struct ModelRegistry {
    snapshot: RwLock<Arc<Vec<ModelBackend>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self { snapshot: RwLock::new(Arc::new(Vec::new())) }
    }

    /// Atomically replace the registered model list.
    pub fn install(&self, models: Vec<ModelBackend>) {
        *self.snapshot.write().expect("registry lock poisoned") = Arc::new(models);
    }

    /// Snapshot of all models in registration order.
    pub fn list(&self) -> Arc<Vec<ModelBackend>> {
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    /// Resolve a public model name to its backend.
    pub fn resolve(&self, name: &str) -> Result<ModelBackend, GatewayError> {
        let models = self.list();
        models.iter().find(|m| m.name == name).cloned().ok_or_else(|| {
            GatewayError::ModelNotFound {
                model: name.to_string(),
                available: models.iter().map(|m| m.name.clone()).collect(),
            }
        })
    }

    /// The first-registered model name, if any.
    pub fn default_model(&self) -> Option<String> {
        self.list().first().map(|m| m.name.clone())
    }

    pub fn model_count(&self) -> usize {
        self.list().len()
    }
}

/// Load the catalog at `path` and install it into both the registry and the
/// tiering resolver. On any failure the live state is left untouched.
///
/// Returns the number of models installed.
pub fn load_and_install(
    path: &Path,
    registry: &ModelRegistry,
    tiering: &TieringResolver,
) -> anyhow::Result<usize> {
    let catalog = Catalog::load(path)?;
    let count = catalog.models.len();
    registry.install(catalog.models);
    tiering.install(catalog.tiering);
    Ok(count)
}

mod defaults {
    pub fn provider() -> String {
        "unknown".into()
    }
    pub fn tier() -> String {
        "standard".into()
    }
    pub fn capabilities() -> Vec<String> {
        vec!["chat".into()]
    }
    pub fn context_length() -> i64 {
        4096
    }
}
