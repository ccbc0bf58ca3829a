//! Content-based model tiering.
//!
//! Requests can be steered to a cheap classification model, a strong
//! reasoning model, or the balanced default — either explicitly via the
//! `X-Gonka-Tier` header or automatically by matching configured regex rules
//! against the most recent user message.
//!
//! Rules are compiled once per catalog (re)load, never per request. Patterns
//! match case-insensitively.

use std::sync::{Arc, RwLock};

use anyhow::Context;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::sessions::{ChatMessage, Role};

/// The three routing tiers a rule or hint can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierTarget {
    Classification,
    Reasoning,
    Default,
}

impl TierTarget {
    /// Parse a header hint. Accepts the bare tier names and their
    /// `_model`-suffixed aliases; anything else is ignored.
    fn from_hint(hint: &str) -> Option<Self> {
        match hint {
            "classification" | "classification_model" => Some(Self::Classification),
            "reasoning" | "reasoning_model" => Some(Self::Reasoning),
            "default" | "default_model" => Some(Self::Default),
            _ => None,
        }
    }
}

/// Raw `[tiering]` section of the catalog file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TieringSection {
    #[serde(default)]
    pub classification_model: String,
    #[serde(default)]
    pub reasoning_model: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub rules: Vec<RuleSection>,
}

/// Raw `[[tiering.rules]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSection {
    pub pattern: String,
    pub route_to: TierTarget,
}

/// A rule with its pattern compiled.
#[derive(Debug, Serialize)]
pub struct TieringRule {
    pub pattern: String,
    pub route_to: TierTarget,
    #[serde(skip)]
    compiled: Regex,
}

/// Compiled tiering configuration, swapped atomically on reload.
#[derive(Debug, Default, Serialize)]
pub struct TieringConfig {
    pub classification_model: String,
    pub reasoning_model: String,
    pub default_model: String,
    pub rules: Vec<TieringRule>,
}

impl TieringConfig {
    /// Compile a raw catalog section. Fails on an invalid rule pattern so a
    /// bad reload can be rejected without disturbing the live config.
    pub fn compile(section: &TieringSection) -> anyhow::Result<Self> {
        let rules = section
            .rules
            .iter()
            .map(|rule| {
                let compiled = RegexBuilder::new(&rule.pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("compiling tiering rule pattern `{}`", rule.pattern))?;
                Ok(TieringRule { pattern: rule.pattern.clone(), route_to: rule.route_to, compiled })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            classification_model: section.classification_model.clone(),
            reasoning_model: section.reasoning_model.clone(),
            default_model: section.default_model.clone(),
            rules,
        })
    }

    /// The model name configured for a tier (possibly empty).
    fn target_model(&self, target: TierTarget) -> &str {
        match target {
            TierTarget::Classification => &self.classification_model,
            TierTarget::Reasoning => &self.reasoning_model,
            TierTarget::Default => &self.default_model,
        }
    }
}

/// Resolver handle holding the live compiled config.
pub struct TieringResolver {
    config: RwLock<Arc<TieringConfig>>,
}

impl TieringResolver {
    pub fn new() -> Self {
        Self { config: RwLock::new(Arc::new(TieringConfig::default())) }
    }

    /// Atomically replace the live config. Called on catalog (re)load.
    pub fn install(&self, config: TieringConfig) {
        *self.config.write().expect("tiering config lock poisoned") = Arc::new(config);
    }

    /// Snapshot of the live config, for the admin view.
    pub fn snapshot(&self) -> Arc<TieringConfig> {
        self.config.read().expect("tiering config lock poisoned").clone()
    }

    /// Pick the model for a request. First non-empty answer wins:
    ///
    /// 1. a recognized `tier_hint` whose configured model is non-empty,
    /// 2. the explicitly requested model,
    /// 3. the first rule matching the last user message's text,
    /// 4. the configured default model (which may itself be empty).
    pub fn resolve(
        &self,
        messages: &[ChatMessage],
        requested_model: &str,
        tier_hint: Option<&str>,
    ) -> String {
        let config = self.snapshot();

        if let Some(target) = tier_hint.and_then(TierTarget::from_hint) {
            let model = config.target_model(target);
            if !model.is_empty() {
                return model.to_string();
            }
        }

        if !requested_model.is_empty() {
            return requested_model.to_string();
        }

        let text = last_user_text(messages);
        if !text.is_empty() {
            for rule in &config.rules {
                if rule.compiled.is_match(&text) {
                    let model = config.target_model(rule.route_to);
                    if !model.is_empty() {
                        return model.to_string();
                    }
                }
            }
        }

        config.default_model.clone()
    }
}

/// Text of the most recent user message. Structured content contributes its
/// `text`-typed parts, joined by spaces.
fn last_user_text(messages: &[ChatMessage]) -> String {
    for message in messages.iter().rev() {
        if message.role != Role::User {
            continue;
        }
        match &message.content {
            serde_json::Value::String(s) => return s.clone(),
            serde_json::Value::Array(parts) => {
                return parts
                    .iter()
                    .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join(" ");
            }
            _ => return String::new(),
        }
    }
    String::new()
}
