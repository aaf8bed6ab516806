//! Handler and classifier contracts.
//!
//! A handler answers one turn. While it works it may emit any number of
//! intermediate messages (tool narration, partial text); every emitted message
//! is delivered to the observation hooks registered on the handler, in
//! registration order. Hooks are registered and removed by name through
//! [`HookRegistry`], so callers never patch a live handler.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::memory::ConversationMemory;
use crate::message::Message;
use crate::routing::RoutingSchema;

/// Callback fired for every message a handler emits.
pub type MessageHook = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHook`].
pub fn message_hook<F, Fut>(f: F) -> MessageHook
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Named, ordered set of observation hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<(String, MessageHook)>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.names())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook. A hook with the same name is replaced in place.
    pub fn register(&self, name: impl Into<String>, hook: MessageHook) {
        let name = name.into();
        let mut hooks = self.hooks.write();
        if let Some(slot) = hooks.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = hook;
        } else {
            hooks.push((name, hook));
        }
    }

    /// Remove a hook by name. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let before = hooks.len();
        hooks.retain(|(n, _)| n != name);
        hooks.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.read().iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> Vec<String> {
        self.hooks.read().iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    /// Deliver a message to every registered hook in order.
    pub async fn emit(&self, message: &Message) {
        // Snapshot so hooks may unregister themselves while running.
        let hooks: Vec<MessageHook> = self.hooks.read().iter().map(|(_, h)| h.clone()).collect();
        for hook in hooks {
            hook(message.clone()).await;
        }
    }
}

/// View any handler or classifier as [`Stateful`] without trait upcasting.
pub trait AsStateful {
    fn as_stateful(&self) -> &dyn Stateful;
}

impl<T: Stateful> AsStateful for T {
    fn as_stateful(&self) -> &dyn Stateful {
        self
    }
}

/// Anything that owns a conversational memory that can be saved and restored.
pub trait Stateful: AsStateful + Send + Sync {
    /// Stable name used as the key in state snapshots.
    fn name(&self) -> &str;

    fn memory(&self) -> &ConversationMemory;

    /// Handler-native serialization of the full state.
    fn state_dict(&self) -> CoreResult<Value> {
        Ok(json!({ "memory": self.memory().get() }))
    }

    /// Restore from [`Stateful::state_dict`] output.
    ///
    /// In strict mode the payload must contain exactly the `memory` key.
    /// Non-strict mode ignores unknown keys and treats a missing memory as empty.
    fn load_state_dict(&self, state: &Value, strict: bool) -> CoreResult<()> {
        let object = state
            .as_object()
            .ok_or_else(|| CoreError::invalid_state(self.name(), "state is not an object"))?;

        if strict {
            if let Some(key) = object.keys().find(|k| k.as_str() != "memory") {
                return Err(CoreError::invalid_state(
                    self.name(),
                    format!("unexpected key '{}'", key),
                ));
            }
        }

        let messages = match object.get("memory") {
            Some(value) => serde_json::from_value::<Vec<Message>>(value.clone())?,
            None if strict => {
                return Err(CoreError::invalid_state(self.name(), "missing 'memory'"));
            }
            None => Vec::new(),
        };
        self.memory().replace(messages);
        Ok(())
    }
}

/// A conversational responder for one turn.
#[async_trait]
pub trait Handler: Stateful {
    fn hooks(&self) -> &HookRegistry;

    /// Answer a message. Intermediate output goes through [`Handler::emit`].
    async fn reply(&self, message: &Message) -> CoreResult<Message>;

    fn register_hook(&self, name: &str, hook: MessageHook) {
        self.hooks().register(name, hook);
    }

    fn unregister_hook(&self, name: &str) -> bool {
        self.hooks().unregister(name)
    }

    async fn emit(&self, message: &Message) {
        self.hooks().emit(message).await;
    }
}

/// Output of a classifier call. There is deliberately no text field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub metadata: Option<Value>,
}

impl ClassifierOutput {
    pub fn new(metadata: Value) -> Self {
        Self {
            metadata: Some(metadata),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Maps a message to a structured routing payload.
#[async_trait]
pub trait Classifier: Stateful {
    async fn invoke(&self, message: &Message, schema: &RoutingSchema) -> CoreResult<ClassifierOutput>;
}
