//! Application configuration.
//!
//! Loaded from an optional YAML file, then overridden from the environment:
//!
//! - `HOWTOLIVE_SESSIONS_DIR`: session store root
//! - `HOWTOLIVE_MODEL`: model name
//! - the variable named by `llm.api_key_env` (default `HOWTOLIVE_API_KEY`): API key
//!
//! ```yaml
//! sessions:
//!   root: ./sessions
//!   compact: true
//!   max_messages_per_agent: 12
//! llm:
//!   model: gpt-4o-mini
//! specialists:
//!   - name: howtocook
//!     description: Recipes and cooking techniques
//!     keywords: [recipe, cook, dinner]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use howtolive_core::{RoutingDecision, RoutingSchema};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ChatError, ChatResult};

/// Environment variable overriding the session root.
pub const ENV_SESSIONS_DIR: &str = "HOWTOLIVE_SESSIONS_DIR";
/// Environment variable overriding the model.
pub const ENV_MODEL: &str = "HOWTOLIVE_MODEL";
/// Default name of the API key variable.
pub const DEFAULT_API_KEY_ENV: &str = "HOWTOLIVE_API_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub sessions: SessionsConfig,
    pub streaming: StreamingConfig,
    pub llm: LlmConfig,
    pub general: GeneralConfig,
    pub specialists: Vec<SpecialistConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sessions: SessionsConfig::default(),
            streaming: StreamingConfig::default(),
            llm: LlmConfig::default(),
            general: GeneralConfig::default(),
            specialists: default_specialists(),
        }
    }
}

impl AppConfig {
    /// Load from a YAML file (or defaults) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> ChatResult<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    ChatError::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                debug!(path = %path.display(), "Loading configuration");
                Self::from_yaml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML without applying environment overrides.
    pub fn from_yaml_str(yaml: &str) -> ChatResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| ChatError::Config(e.to_string()))
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(root) = non_empty(ENV_SESSIONS_DIR) {
            self.sessions.root = PathBuf::from(root);
        }
        if let Some(model) = non_empty(ENV_MODEL) {
            self.llm.model = model;
        }
        if let Some(key) = non_empty(&self.llm.api_key_env) {
            self.llm.api_key = Some(key);
        }
    }

    /// Reject duplicate, empty or reserved specialist names and zero stream limits.
    pub fn validate(&self) -> ChatResult<()> {
        let mut seen = HashSet::new();
        for specialist in &self.specialists {
            let name = specialist.name.trim();
            if name.is_empty() {
                return Err(ChatError::Config("specialist name must not be empty".into()));
            }
            if name == RoutingDecision::GENERAL || name == RoutingDecision::NONE {
                return Err(ChatError::Config(format!(
                    "'{}' is reserved for the default handler",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(ChatError::Config(format!("duplicate specialist '{}'", name)));
            }
        }
        if self.streaming.idle_timeout_secs == 0 {
            return Err(ChatError::Config("streaming.idle_timeout_secs must be > 0".into()));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(ChatError::Config("streaming.channel_capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Label set the classifier chooses from.
    pub fn routing_schema(&self) -> RoutingSchema {
        RoutingSchema::new(self.specialists.iter().map(|s| s.name.clone()))
    }

    pub fn specialist(&self, name: &str) -> Option<&SpecialistConfig> {
        self.specialists.iter().find(|s| s.name == name)
    }
}

/// Session store settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionsConfig {
    /// Root directory for all users
    pub root: PathBuf,
    /// Persist `{role, name, text}` tuples instead of full handler state.
    /// Compact snapshots drop non-text content blocks.
    pub compact: bool,
    /// Persist the router's memory as well
    pub include_router: bool,
    /// Compact mode keeps this many most recent messages per handler
    pub max_messages_per_agent: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("sessions"),
            compact: true,
            include_router: false,
            max_messages_per_agent: 12,
        }
    }
}

/// Streaming bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Maximum wait for the next emitted message
    pub idle_timeout_secs: u64,
    /// Bound of the hand-off channel
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30,
            channel_capacity: 64,
        }
    }
}

impl StreamingConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// OpenAI-compatible chat completions endpoint.
///
/// The client is only built when an API key resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Name of the variable holding the API key
    pub api_key_env: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
    /// Resolved API key, never serialized
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            temperature: None,
            max_tokens: Some(2048),
            timeout_secs: 120,
            api_key: None,
        }
    }
}

impl LlmConfig {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

/// The default handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    pub system_prompt: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a friendly healthy-living assistant. Answer general questions \
                            about wellbeing concisely and suggest a specialist topic when useful."
                .to_string(),
        }
    }
}

/// One specialist handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Words routing to this specialist when no model is configured
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl SpecialistConfig {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            system_prompt: String::new(),
            keywords: Vec::new(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// System prompt, falling back to one derived from the description.
    pub fn effective_prompt(&self) -> String {
        if self.system_prompt.trim().is_empty() {
            format!(
                "You are the {} specialist. {} Answer practically and concisely.",
                self.name, self.description
            )
        } else {
            self.system_prompt.clone()
        }
    }
}

fn default_specialists() -> Vec<SpecialistConfig> {
    vec![
        SpecialistConfig::new("howtoeat", "Nutrition, diets and what to eat.").with_keywords([
            "eat", "diet", "nutrition", "protein", "calorie", "vitamin", "meal plan",
        ]),
        SpecialistConfig::new("howtocook", "Recipes, cooking techniques and meal preparation.")
            .with_keywords(["recipe", "cook", "dinner", "lunch", "breakfast", "bake", "ingredient"]),
        SpecialistConfig::new("howtoexercise", "Workouts, training plans and physical activity.")
            .with_keywords(["exercise", "workout", "run", "gym", "training", "stretch", "muscle"]),
        SpecialistConfig::new("howtosleep", "Sleep hygiene, rest and recovery.")
            .with_keywords(["sleep", "insomnia", "nap", "tired", "bedtime", "rest"]),
    ]
}
