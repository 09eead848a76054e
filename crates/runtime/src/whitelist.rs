//! Tool whitelists and their composition across scopes.

use claw_sdk_tools::{canonical_name, ToolDefinition};
use std::collections::BTreeSet;
use std::fmt;

/// Set of canonical tool names a scope permits.
///
/// An empty name list means the scope places no restriction. Restricted
/// scopes compose by intersection: a tool is permitted only if every scope
/// permits it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ToolWhitelist {
    #[default]
    Unrestricted,
    Only(BTreeSet<String>),
}

impl ToolWhitelist {
    /// Build from raw names. Empty input (after dropping blank names) is
    /// unrestricted.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = names
            .into_iter()
            .map(|n| canonical_name(n.as_ref()))
            .filter(|n| !n.is_empty())
            .collect();
        if set.is_empty() {
            ToolWhitelist::Unrestricted
        } else {
            ToolWhitelist::Only(set)
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        matches!(self, ToolWhitelist::Unrestricted)
    }

    pub fn allows(&self, tool: &str) -> bool {
        match self {
            ToolWhitelist::Unrestricted => true,
            ToolWhitelist::Only(set) => set.contains(&canonical_name(tool)),
        }
    }

    /// Tools permitted by both `self` and `other`.
    pub fn intersect(&self, other: &ToolWhitelist) -> ToolWhitelist {
        match (self, other) {
            (ToolWhitelist::Unrestricted, x) | (x, ToolWhitelist::Unrestricted) => x.clone(),
            (ToolWhitelist::Only(a), ToolWhitelist::Only(b)) => {
                ToolWhitelist::Only(a.intersection(b).cloned().collect())
            }
        }
    }

    /// Names of a restricted set, sorted; empty for unrestricted.
    pub fn names(&self) -> Vec<String> {
        match self {
            ToolWhitelist::Unrestricted => Vec::new(),
            ToolWhitelist::Only(set) => set.iter().cloned().collect(),
        }
    }

    pub fn filter(&self, definitions: Vec<ToolDefinition>) -> Vec<ToolDefinition> {
        definitions
            .into_iter()
            .filter(|d| self.allows(&d.name))
            .collect()
    }
}

impl fmt::Display for ToolWhitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolWhitelist::Unrestricted => f.write_str("*"),
            ToolWhitelist::Only(set) => {
                let names: Vec<&str> = set.iter().map(String::as_str).collect();
                write!(f, "[{}]", names.join(", "))
            }
        }
    }
}

/// Whitelists in force for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhitelistScopes {
    pub request: ToolWhitelist,
    pub subagent: ToolWhitelist,
}

impl WhitelistScopes {
    pub fn new(request: ToolWhitelist, subagent: ToolWhitelist) -> Self {
        Self { request, subagent }
    }

    pub fn effective(&self) -> ToolWhitelist {
        self.request.intersect(&self.subagent)
    }

    /// Name of the first scope that rejects `tool`, if any.
    pub fn denied_by(&self, tool: &str) -> Option<&'static str> {
        if !self.request.allows(tool) {
            Some("request")
        } else if !self.subagent.allows(tool) {
            Some("subagent")
        } else {
            None
        }
    }

    pub fn allows(&self, tool: &str) -> bool {
        self.denied_by(tool).is_none()
    }
}
