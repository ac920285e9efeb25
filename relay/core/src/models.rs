//! Model Capability Records
//!
//! One record per provider model. The orchestrator is generic over these; no
//! per-model code paths exist.

use serde::{Deserialize, Serialize};

use crate::auth::UserInfo;

/// Who may use a model
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Every logged-in account
    #[default]
    Any,
    /// Accounts whose `chat_models` lists the model id
    Listed,
}

/// Capability record for one model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Display name
    pub name: String,
    /// Provider model id (None = provider default)
    pub model_id: Option<u32>,
    /// Provider role id
    pub role_id: u32,
    /// Maximum prompt size in tokens
    pub max_token_limit: u32,
    /// Permission predicate
    pub permission: Permission,
}

impl ModelProfile {
    /// Provider default role
    pub const DEFAULT_ROLE: u32 = 1;

    fn new(name: &str, model_id: Option<u32>, max_token_limit: u32) -> Self {
        Self {
            name: name.to_string(),
            model_id,
            role_id: Self::DEFAULT_ROLE,
            max_token_limit,
            permission: Permission::Any,
        }
    }

    /// Whether `user` may use this model
    #[must_use]
    pub fn can_use(&self, user: &UserInfo) -> bool {
        match (self.permission, self.model_id) {
            (Permission::Any, _) | (Permission::Listed, None) => true,
            (Permission::Listed, Some(id)) => user.chat_models.contains(&id),
        }
    }

    /// Require the listed-model entitlement
    #[must_use]
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }
}

/// Built-in model catalogue
#[must_use]
pub fn catalogue() -> Vec<ModelProfile> {
    vec![
        ModelProfile::new("aibox-v1", None, 40_000),
        ModelProfile::new("GPT4o-mini", Some(1), 128_000),
        ModelProfile::new("GPT4o", Some(11), 128_000),
        ModelProfile::new("Gemini-1.5-pro", Some(20), 128_000),
        ModelProfile::new("Claude-3.5-Sonnet", Some(23), 128_000),
    ]
}

/// Look up a catalogue entry by name (case-insensitive)
#[must_use]
pub fn find(name: &str) -> Option<ModelProfile> {
    catalogue()
        .into_iter()
        .find(|m| m.name.eq_ignore_ascii_case(name))
}
