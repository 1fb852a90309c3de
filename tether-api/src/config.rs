//! Per-conversation configuration snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// How much the agent may do without asking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    /// Allow every tool.
    Open,
    /// Allow only read-oriented tools.
    Guarded,
    /// Prompt for every tool.
    Supervised,
    /// Leave the agent's own default in place.
    #[default]
    Default,
}

impl PermissionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionPolicy::Open => "open",
            PermissionPolicy::Guarded => "guarded",
            PermissionPolicy::Supervised => "supervised",
            PermissionPolicy::Default => "default",
        }
    }
}

impl fmt::Display for PermissionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown permission policy '{0}' (expected open, guarded, supervised or default)")]
pub struct UnknownPolicy(pub String);

impl FromStr for PermissionPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(PermissionPolicy::Open),
            "guarded" => Ok(PermissionPolicy::Guarded),
            "supervised" => Ok(PermissionPolicy::Supervised),
            "default" => Ok(PermissionPolicy::Default),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// Snapshot of everything needed to start one turn.
///
/// The value handed to a spawn is never mutated afterwards; the owner of the
/// conversation writes captured resume ids back into its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationConfig {
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub permission_policy: PermissionPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl ConversationConfig {
    pub fn new(working_directory: impl Into<PathBuf>) -> Self {
        Self {
            working_directory: working_directory.into(),
            resume_id: None,
            permission_policy: PermissionPolicy::Default,
            model: None,
            system_prompt: None,
        }
    }

    pub fn with_resume_id(mut self, resume_id: impl Into<String>) -> Self {
        self.resume_id = Some(resume_id.into());
        self
    }

    pub fn with_permission_policy(mut self, policy: PermissionPolicy) -> Self {
        self.permission_policy = policy;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
