//! Scripted handlers and classifiers for testing.
//!
//! These implement the handler contracts with predefined behavior so that
//! streaming, routing and persistence can be tested without a language model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::handler::{Classifier, ClassifierOutput, Handler, HookRegistry, Stateful};
use crate::memory::ConversationMemory;
use crate::message::Message;
use crate::routing::RoutingSchema;

/// How a scripted reply ends after its emissions.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedEnd {
    /// Return the last emitted message (or an empty reply)
    LastEmitted,
    /// Return a message with this text without emitting it
    Reply(String),
    /// Return an error
    Fail(String),
    /// Never return
    Hang,
    /// Panic inside the handler
    Panic(String),
}

/// Observable counters shared between a scripted handler and a test.
#[derive(Debug, Default)]
pub struct HandlerProbe {
    calls: AtomicUsize,
    active: AtomicUsize,
    received: RwLock<Vec<Message>>,
}

impl HandlerProbe {
    /// Number of `reply` calls started.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `reply` calls currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Messages received, in call order.
    pub fn received(&self) -> Vec<Message> {
        self.received.read().clone()
    }
}

struct ActiveGuard(Arc<HandlerProbe>);

impl ActiveGuard {
    fn enter(probe: &Arc<HandlerProbe>) -> Self {
        probe.calls.fetch_add(1, Ordering::SeqCst);
        probe.active.fetch_add(1, Ordering::SeqCst);
        Self(probe.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handler that emits a fixed script of texts.
pub struct ScriptedHandler {
    name: String,
    memory: ConversationMemory,
    hooks: HookRegistry,
    emissions: Vec<String>,
    delay: Duration,
    end: ScriptedEnd,
    probe: Arc<HandlerProbe>,
}

impl ScriptedHandler {
    /// Create a handler that replies with nothing.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory: ConversationMemory::new(),
            hooks: HookRegistry::new(),
            emissions: Vec::new(),
            delay: Duration::ZERO,
            end: ScriptedEnd::LastEmitted,
            probe: Arc::new(HandlerProbe::default()),
        }
    }

    /// Handler that emits `text` once and returns it.
    pub fn replying(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name).emit(text)
    }

    /// Add a text to emit.
    pub fn emit(mut self, text: impl Into<String>) -> Self {
        self.emissions.push(text.into());
        self
    }

    /// Sleep before every emission.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn ending(mut self, end: ScriptedEnd) -> Self {
        self.end = end;
        self
    }

    /// Share the probe with another handle (e.g. a factory).
    pub fn with_probe(mut self, probe: Arc<HandlerProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn probe(&self) -> Arc<HandlerProbe> {
        self.probe.clone()
    }
}

impl Stateful for ScriptedHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory(&self) -> &ConversationMemory {
        &self.memory
    }
}

#[async_trait]
impl Handler for ScriptedHandler {
    fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    async fn reply(&self, message: &Message) -> CoreResult<Message> {
        let _guard = ActiveGuard::enter(&self.probe);
        self.probe.received.write().push(message.clone());
        self.memory.add(message.clone());

        let mut last = None;
        for text in &self.emissions {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let emitted = Message::assistant(&self.name, text);
            self.emit(&emitted).await;
            last = Some(emitted);
        }

        let reply = match &self.end {
            ScriptedEnd::LastEmitted => last.unwrap_or_else(|| Message::assistant(&self.name, "")),
            ScriptedEnd::Reply(text) => Message::assistant(&self.name, text),
            ScriptedEnd::Fail(reason) => {
                return Err(CoreError::handler_failed(&self.name, reason));
            }
            ScriptedEnd::Hang => std::future::pending().await,
            ScriptedEnd::Panic(reason) => panic!("{}", reason),
        };

        self.memory.add(reply.clone());
        Ok(reply)
    }
}

/// Classifier returning a predefined structured payload.
pub struct ScriptedClassifier {
    name: String,
    memory: ConversationMemory,
    output: Result<Option<Value>, String>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedClassifier {
    /// Classifier that always picks `label`.
    pub fn routing_to(label: impl Into<String>) -> Self {
        Self::with_metadata(json!({ "your_choice": label.into(), "note": null }))
    }

    /// Classifier that returns arbitrary metadata.
    pub fn with_metadata(metadata: Value) -> Self {
        Self::build(Ok(Some(metadata)))
    }

    /// Classifier that returns no metadata at all.
    pub fn empty() -> Self {
        Self::build(Ok(None))
    }

    /// Classifier whose invoke fails.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self::build(Err(reason.into()))
    }

    fn build(output: Result<Option<Value>, String>) -> Self {
        Self {
            name: "general-router".to_string(),
            memory: ConversationMemory::new(),
            output,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Shared call counter, usable after the classifier moved into a turn.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Stateful for ScriptedClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn memory(&self) -> &ConversationMemory {
        &self.memory
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn invoke(&self, message: &Message, _schema: &RoutingSchema) -> CoreResult<ClassifierOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.memory.add(message.clone());
        match &self.output {
            Ok(metadata) => Ok(ClassifierOutput {
                metadata: metadata.clone(),
            }),
            Err(reason) => Err(CoreError::Classification(reason.clone())),
        }
    }
}
