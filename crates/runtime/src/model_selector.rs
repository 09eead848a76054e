//! Cost-tier model resolution.

use crate::interfaces::{Model, RuntimeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Low,
    Mid,
    High,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelTier::Low => "low",
            ModelTier::Mid => "mid",
            ModelTier::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for ModelTier {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(ModelTier::Low),
            "mid" => Ok(ModelTier::Mid),
            "high" => Ok(ModelTier::High),
            other => Err(RuntimeError::ConfigError(format!(
                "Unknown model tier: {}",
                other
            ))),
        }
    }
}

/// Why a model was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    RequestOverride,
    SubagentMapping,
    Default,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionReason::RequestOverride => "request_override",
            SelectionReason::SubagentMapping => "subagent_mapping",
            SelectionReason::Default => "default",
        };
        f.write_str(name)
    }
}

pub struct Selection {
    pub model: Arc<dyn Model>,
    /// `None` when the default model serves the request.
    pub tier: Option<ModelTier>,
    pub reason: SelectionReason,
}

/// Default model plus optional per-tier models and subagent → tier mapping.
#[derive(Clone)]
pub struct ModelPool {
    default: Arc<dyn Model>,
    tiers: HashMap<ModelTier, Arc<dyn Model>>,
    subagent_tiers: HashMap<String, ModelTier>,
}

impl ModelPool {
    pub fn new(default: Arc<dyn Model>) -> Self {
        Self {
            default,
            tiers: HashMap::new(),
            subagent_tiers: HashMap::new(),
        }
    }

    pub fn with_tier(mut self, tier: ModelTier, model: Arc<dyn Model>) -> Self {
        self.tiers.insert(tier, model);
        self
    }

    /// Map a subagent type (case-insensitive) to a tier.
    pub fn with_subagent_tier(mut self, subagent: &str, tier: ModelTier) -> Self {
        self.subagent_tiers
            .insert(subagent.trim().to_lowercase(), tier);
        self
    }

    pub fn default_model(&self) -> Arc<dyn Model> {
        Arc::clone(&self.default)
    }

    pub fn has_tier(&self, tier: ModelTier) -> bool {
        self.tiers.contains_key(&tier)
    }

    /// Request override, then subagent mapping, then the default model.
    /// A tier without a configured model falls through to the next rule.
    pub fn select(&self, requested: Option<ModelTier>, subagent: Option<&str>) -> Selection {
        if let Some(tier) = requested {
            if let Some(model) = self.tiers.get(&tier) {
                return Selection {
                    model: Arc::clone(model),
                    tier: Some(tier),
                    reason: SelectionReason::RequestOverride,
                };
            }
        }

        let mapped = subagent
            .map(|name| name.trim().to_lowercase())
            .and_then(|name| self.subagent_tiers.get(&name).copied());
        if let Some(tier) = mapped {
            if let Some(model) = self.tiers.get(&tier) {
                return Selection {
                    model: Arc::clone(model),
                    tier: Some(tier),
                    reason: SelectionReason::SubagentMapping,
                };
            }
        }

        Selection {
            model: self.default_model(),
            tier: None,
            reason: SelectionReason::Default,
        }
    }
}
