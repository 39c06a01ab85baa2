//! Environment-backed runtime configuration.
//!
//! Missing chat credentials are kept as empty strings so each stage can
//! fail at call time with a missing-credential error instead of failing
//! the whole CLI at startup. Tracker settings surface at publisher
//! setup the same way.

use tracing::warn;

use crate::models::Stage;

pub const DEFAULT_CHAT_API_BASE: &str = "http://localhost/v1";
pub const DEFAULT_CHAT_USER: &str = "blueprint-user";

/// Chat endpoint settings plus the per-stage app credentials.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub base_url: String,
    pub user: String,
    pub planning_api_key: String,
    pub spec_api_key: String,
    pub task_api_key: String,
    pub issue_api_key: String,
}

impl ChatConfig {
    /// Credential for a stage's remote app. The endpoint hosts one app
    /// per stage, each with its own key.
    pub fn api_key_for(&self, stage: Stage) -> &str {
        match stage {
            Stage::Planning => &self.planning_api_key,
            Stage::Spec => &self.spec_api_key,
            Stage::Task => &self.task_api_key,
            Stage::Issue => &self.issue_api_key,
            Stage::Publish | Stage::Done | Stage::Error => "",
        }
    }
}

/// Issue tracker settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub token: String,
    pub owner: String,
    pub repo: String,
    pub board_number: Option<u32>,
}

impl TrackerConfig {
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty() && !self.owner.is_empty() && !self.repo.is_empty()
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub chat: ChatConfig,
    pub tracker: TrackerConfig,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup. Tests inject a
    /// map instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).unwrap_or_default();

        let board_number = match lookup("GITHUB_PROJECT_NUMBER") {
            None => None,
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(number) => Some(number),
                Err(_) => {
                    warn!(
                        "GITHUB_PROJECT_NUMBER is not a valid number, ignoring it: {:?}",
                        raw
                    );
                    None
                }
            },
        };

        Config {
            chat: ChatConfig {
                base_url: lookup("CHAT_API_BASE")
                    .unwrap_or_else(|| DEFAULT_CHAT_API_BASE.to_string()),
                user: lookup("CHAT_USER").unwrap_or_else(|| DEFAULT_CHAT_USER.to_string()),
                planning_api_key: get("PLANNING_APP_API_KEY"),
                spec_api_key: get("SPEC_APP_API_KEY"),
                task_api_key: get("TASK_APP_API_KEY"),
                issue_api_key: get("ISSUE_APP_API_KEY"),
            },
            tracker: TrackerConfig {
                token: get("GITHUB_TOKEN"),
                owner: get("GITHUB_OWNER"),
                repo: get("GITHUB_REPO"),
                board_number,
            },
        }
    }
}
