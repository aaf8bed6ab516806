//! Handler set construction.
//!
//! [`DefaultHandlerFactory`] builds the general handler, one handler per
//! configured specialist and the router for every request. With a language
//! model available they are LLM-backed; otherwise the offline
//! [`KeywordClassifier`] and [`CannedHandler`] take over so the rest of the
//! system (streaming, persistence) keeps working.

use std::sync::Arc;

use async_trait::async_trait;
use howtolive_core::{
    Classifier, ClassifierOutput, ConversationMemory, CoreError, CoreResult, Handler, HookRegistry,
    Message, ProcessTier, Role, RoutingDecision, RoutingSchema, Stateful,
};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{AppConfig, SpecialistConfig};
use crate::context::HandlerFactory;
use crate::error::ChatResult;
use crate::llm::{LlmClassifier, LlmClient, LlmHandler, ROUTER_NAME};
use crate::orchestrator::TurnHandlers;
use crate::types::UserKey;

/// Name of the default handler.
pub const GENERAL_HANDLER: &str = "general";

/// Process-tier resource name of the LLM client.
pub const LLM_RESOURCE: &str = "llm";

// ============================================================================
// Offline router
// ============================================================================

/// Routes by counting configured keywords in the message.
pub struct KeywordClassifier {
    keywords: Vec<(String, Vec<String>)>,
    memory: ConversationMemory,
}

impl KeywordClassifier {
    pub fn new(specialists: &[SpecialistConfig]) -> Self {
        Self {
            keywords: specialists
                .iter()
                .map(|s| {
                    let words = s.keywords.iter().map(|k| k.to_lowercase()).collect();
                    (s.name.clone(), words)
                })
                .collect(),
            memory: ConversationMemory::new(),
        }
    }

    /// Best label for a text. Single-word keywords match word prefixes.
    /// Ties go to the first configured specialist.
    pub fn classify_text(&self, text: &str, schema: &RoutingSchema) -> RoutingDecision {
        let text = text.to_lowercase();
        if text.trim().is_empty() {
            return RoutingDecision::new(RoutingDecision::NONE);
        }
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        let matches = |keyword: &str| {
            if keyword.contains(' ') {
                text.contains(keyword)
            } else {
                words.iter().any(|w| w.starts_with(keyword))
            }
        };

        let mut best: Option<(&str, Vec<&str>)> = None;
        for (label, keywords) in &self.keywords {
            if !schema.is_specialist(label) {
                continue;
            }
            let hits: Vec<&str> = keywords
                .iter()
                .map(String::as_str)
                .filter(|k| matches(*k))
                .collect();
            let better = match &best {
                Some((_, current)) => hits.len() > current.len(),
                None => !hits.is_empty(),
            };
            if better {
                best = Some((label.as_str(), hits));
            }
        }

        match best {
            Some((label, hits)) => {
                RoutingDecision::new(label).with_note(format!("matched: {}", hits.join(", ")))
            }
            None => RoutingDecision::general(),
        }
    }
}

impl Stateful for KeywordClassifier {
    fn name(&self) -> &str {
        ROUTER_NAME
    }

    fn memory(&self) -> &ConversationMemory {
        &self.memory
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn invoke(&self, message: &Message, schema: &RoutingSchema) -> CoreResult<ClassifierOutput> {
        self.memory.add(message.clone());
        let decision = self.classify_text(&message.text(), schema);
        Ok(ClassifierOutput::new(decision.to_value()))
    }
}

// ============================================================================
// Offline handler
// ============================================================================

/// Answers with a fixed acknowledgement, emitted in two steps.
pub struct CannedHandler {
    name: String,
    description: String,
    memory: ConversationMemory,
    hooks: HookRegistry,
}

impl CannedHandler {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            memory: ConversationMemory::new(),
            hooks: HookRegistry::new(),
        }
    }

    fn opening(&self) -> String {
        if self.description.trim().is_empty() {
            format!("This is {}.", self.name)
        } else {
            format!("This is {}. {}", self.name, self.description.trim())
        }
    }
}

impl Stateful for CannedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory(&self) -> &ConversationMemory {
        &self.memory
    }
}

#[async_trait]
impl Handler for CannedHandler {
    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    async fn reply(&self, message: &Message) -> CoreResult<Message> {
        let opening = self.opening();
        self.emit(&Message::assistant(&self.name, opening.clone())).await;

        let earlier = self
            .memory
            .get()
            .iter()
            .filter(|m| m.role == Role::User)
            .count();
        let full = format!(
            "{} No language model is configured, so I can only note your question ({} earlier in this session): \"{}\"",
            opening,
            earlier,
            message.text().trim()
        );
        let reply = Message::assistant(&self.name, full)
            .with_metadata(json!({ "offline": true }));
        self.emit(&reply).await;

        self.memory.add(message.clone());
        self.memory.add(reply.clone());
        Ok(reply)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Process-tier bundle.
#[derive(Debug, Clone, Default)]
pub struct SharedResources {
    /// Absent when no key is configured or the client failed to build
    pub llm: Option<Arc<LlmClient>>,
}

/// Per-user bundle.
#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user: UserKey,
    /// Prepended to every system prompt
    pub preamble: String,
}

/// Builds LLM-backed handlers, or offline ones without a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandlerFactory;

impl DefaultHandlerFactory {
    fn prompt(user: &UserProfile, prompt: &str) -> String {
        format!("{}\n\n{}", user.preamble, prompt)
    }
}

#[async_trait]
impl HandlerFactory for DefaultHandlerFactory {
    type Shared = SharedResources;
    type PerUser = UserProfile;

    async fn init_shared(&self, tier: &ProcessTier, config: &AppConfig) -> SharedResources {
        if !config.llm.is_configured() {
            info!(
                key_env = %config.llm.api_key_env,
                "No API key configured, using offline handlers"
            );
            return SharedResources::default();
        }

        let llm = tier
            .resolve_closeable(LLM_RESOURCE, || async {
                LlmClient::new(&config.llm).map_err(CoreError::from)
            })
            .await;
        if llm.is_none() {
            warn!("LLM client unavailable, using offline handlers");
        }
        SharedResources { llm }
    }

    async fn init_user(&self, _shared: &SharedResources, user: &UserKey) -> ChatResult<UserProfile> {
        Ok(UserProfile {
            user: user.clone(),
            preamble: format!("You are talking with {}.", user.display_name),
        })
    }

    fn build(&self, config: &AppConfig, shared: &SharedResources, user: &UserProfile) -> TurnHandlers {
        match &shared.llm {
            Some(client) => {
                let general = LlmHandler::new(
                    GENERAL_HANDLER,
                    Self::prompt(user, &config.general.system_prompt),
                    client.clone(),
                );
                let classifier = LlmClassifier::new(&config.specialists, client.clone());
                config.specialists.iter().fold(
                    TurnHandlers::new(Arc::new(classifier), Arc::new(general)),
                    |handlers, s| {
                        let prompt = Self::prompt(user, &s.effective_prompt());
                        handlers.with_specialist(Arc::new(LlmHandler::new(&s.name, prompt, client.clone())))
                    },
                )
            }
            None => {
                let general = CannedHandler::new(GENERAL_HANDLER, "General healthy-living questions.");
                let classifier = KeywordClassifier::new(&config.specialists);
                config.specialists.iter().fold(
                    TurnHandlers::new(Arc::new(classifier), Arc::new(general)),
                    |handlers, s| {
                        handlers.with_specialist(Arc::new(CannedHandler::new(&s.name, &s.description)))
                    },
                )
            }
        }
    }
}
