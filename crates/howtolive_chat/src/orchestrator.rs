//! Turn orchestrator.
//!
//! One orchestrator serves one session and is rebuilt for every request. A
//! turn moves through:
//!
//! ```text
//! Routing -> Selected -> Executing -> Persisting -> Done
//!                            |             |
//!                            +--> Failed <-+
//! ```
//!
//! Persisting writes the state snapshot of every handler (the router only when
//! the snapshot policy includes it) and then appends three timeline events:
//! the user message, the routing decision and the reply. It runs before the
//! final delta is handed to the caller. A turn stream dropped before its final
//! delta is not persisted.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::Stream;
use howtolive_core::{
    Classifier, Handler, Message, Role, RoutingDecision, RoutingSchema, Stateful,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatch::DispatchClassifier;
use crate::persistence::SessionStore;
use crate::stream::{stream_reply, DeltaStream, StreamDelta, StreamOptions, StreamOutcome};
use crate::types::{SessionKey, TimelineEvent};

/// Position of the current turn in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Routing,
    Selected,
    Executing,
    Persisting,
    Done,
    Failed,
}

/// Per-request handler set.
#[derive(Clone)]
pub struct TurnHandlers {
    pub classifier: Arc<dyn Classifier>,
    pub general: Arc<dyn Handler>,
    pub specialists: BTreeMap<String, Arc<dyn Handler>>,
}

impl TurnHandlers {
    pub fn new(classifier: Arc<dyn Classifier>, general: Arc<dyn Handler>) -> Self {
        Self {
            classifier,
            general,
            specialists: BTreeMap::new(),
        }
    }

    /// Add a specialist under its own name.
    pub fn with_specialist(mut self, handler: Arc<dyn Handler>) -> Self {
        self.specialists.insert(handler.name().to_string(), handler);
        self
    }

    /// Domain handlers: general first, then specialists by name.
    pub fn domain_handlers(&self) -> Vec<&dyn Stateful> {
        let mut handlers: Vec<&dyn Stateful> = vec![self.general.as_stateful()];
        handlers.extend(self.specialists.values().map(|h| h.as_stateful()));
        handlers
    }
}

/// Summary of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub decision: RoutingDecision,
    /// Name of the handler that served the turn
    pub handler: String,
    /// Final text shown to the caller
    pub reply_text: String,
    pub outcome: StreamOutcome,
    /// Events appended to the timeline, with `seq` assigned when persisted
    pub events: Vec<TimelineEvent>,
    /// Whether both state and timeline were written
    pub persisted: bool,
    pub state: TurnState,
}

/// Routes, runs and persists turns of one session.
#[derive(Clone)]
pub struct Orchestrator {
    key: SessionKey,
    store: SessionStore,
    dispatch: DispatchClassifier,
    handlers: TurnHandlers,
    options: StreamOptions,
    state: Arc<Mutex<TurnState>>,
}

impl Orchestrator {
    pub fn new(
        key: SessionKey,
        store: SessionStore,
        schema: RoutingSchema,
        handlers: TurnHandlers,
        options: StreamOptions,
    ) -> Self {
        Self {
            key,
            store,
            dispatch: DispatchClassifier::new(schema),
            handlers,
            options,
            state: Arc::new(Mutex::new(TurnState::Idle)),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn handlers(&self) -> &TurnHandlers {
        &self.handlers
    }

    /// Current turn state.
    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    fn set_state(&self, state: TurnState) {
        debug!(session = %self.key, ?state, "Turn state");
        *self.state.lock() = state;
    }

    /// Load the stored snapshot into every handler.
    ///
    /// Returns whether a snapshot was found. A missing or unreadable snapshot
    /// leaves handlers empty.
    pub fn restore(&self) -> bool {
        let mut targets = self.handlers.domain_handlers();
        targets.push(self.handlers.classifier.as_stateful());

        match self.store.load_state(&self.key, &targets) {
            Ok(found) => {
                debug!(session = %self.key, found, "State restore");
                found
            }
            Err(e) => {
                warn!(session = %self.key, error = %e, "State restore failed, starting empty");
                for handler in targets {
                    handler.memory().clear();
                }
                false
            }
        }
    }

    /// Handler for a decision. Fallback and unknown labels get the general
    /// handler.
    pub fn select(&self, decision: &RoutingDecision) -> Arc<dyn Handler> {
        if decision.is_fallback() {
            return self.handlers.general.clone();
        }
        match self.handlers.specialists.get(&decision.label) {
            Some(handler) => handler.clone(),
            None => {
                debug!(label = %decision.label, "No handler for label, using general");
                self.handlers.general.clone()
            }
        }
    }

    /// Route the message and start streaming the selected handler.
    pub async fn stream_turn(&self, text: impl Into<String>) -> TurnStream {
        let user = Message::user(text);

        self.set_state(TurnState::Routing);
        let decision = self
            .dispatch
            .classify(self.handlers.classifier.as_ref(), &user)
            .await;

        self.set_state(TurnState::Selected);
        let handler = self.select(&decision);
        info!(
            session = %self.key,
            label = %decision.label,
            handler = handler.name(),
            "Turn routed"
        );

        self.set_state(TurnState::Executing);
        let deltas = stream_reply(handler.clone(), user.clone(), self.options);

        TurnStream {
            orchestrator: self.clone(),
            user,
            decision,
            handler: handler.name().to_string(),
            deltas,
            report: None,
        }
    }

    /// Run a whole turn and return its report.
    pub async fn handle(&self, text: impl Into<String>) -> TurnReport {
        self.stream_turn(text).await.finish().await
    }

    fn persist_turn(
        &self,
        user: &Message,
        decision: &RoutingDecision,
        handler: &str,
        accumulated: String,
        outcome: StreamOutcome,
    ) -> TurnReport {
        self.set_state(TurnState::Persisting);

        let (reply_event, reply_text) = match &outcome {
            StreamOutcome::Completed(reply) => {
                let text = reply.text();
                let text = if text.trim().is_empty() { accumulated } else { text };
                let mut event = TimelineEvent::message(handler, Role::Assistant, text.clone());
                event.structured = reply.metadata.clone();
                (event, text)
            }
            StreamOutcome::Failed(_) => (TimelineEvent::error(handler, accumulated.clone()), accumulated),
            StreamOutcome::TimedOut => (
                TimelineEvent::message(handler, Role::Assistant, accumulated.clone()),
                accumulated,
            ),
        };

        let events = vec![
            TimelineEvent::from_message(user),
            TimelineEvent::route(self.handlers.classifier.name(), decision),
            reply_event,
        ];

        let mut targets = self.handlers.domain_handlers();
        if self.store.policy().include_router {
            targets.push(self.handlers.classifier.as_stateful());
        }

        let state_saved = match self.store.save_state(&self.key, &targets) {
            Ok(()) => true,
            Err(e) => {
                error!(session = %self.key, error = %e, "Failed to save state");
                false
            }
        };

        let (events, events_saved) = match self.store.append_events(&self.key, events.clone()) {
            Ok(appended) => (appended, true),
            Err(e) => {
                error!(session = %self.key, error = %e, "Failed to append timeline events");
                (events, false)
            }
        };

        if let Err(e) = self.store.touch(&self.key) {
            warn!(session = %self.key, error = %e, "Failed to update session metadata");
        }

        let persisted = state_saved && events_saved;
        let state = if !persisted || matches!(outcome, StreamOutcome::Failed(_)) {
            TurnState::Failed
        } else {
            TurnState::Done
        };
        self.set_state(state);

        info!(
            session = %self.key,
            handler,
            persisted,
            ?state,
            "Turn finished"
        );

        TurnReport {
            decision: decision.clone(),
            handler: handler.to_string(),
            reply_text,
            outcome,
            events,
            persisted,
            state,
        }
    }
}

/// Deltas of one turn. Persistence runs when the final delta is pulled.
pub struct TurnStream {
    orchestrator: Orchestrator,
    user: Message,
    decision: RoutingDecision,
    handler: String,
    deltas: DeltaStream,
    report: Option<TurnReport>,
}

impl TurnStream {
    pub fn decision(&self) -> &RoutingDecision {
        &self.decision
    }

    pub fn handler_name(&self) -> &str {
        &self.handler
    }

    /// Available once the final delta has been returned.
    pub fn report(&self) -> Option<&TurnReport> {
        self.report.as_ref()
    }

    /// Next delta. The turn is persisted before the final one is returned.
    pub async fn next(&mut self) -> Option<StreamDelta> {
        let delta = self.deltas.next().await?;
        if delta.is_final {
            let outcome = self.deltas.take_outcome().unwrap_or(StreamOutcome::TimedOut);
            let report = self.orchestrator.persist_turn(
                &self.user,
                &self.decision,
                &self.handler,
                delta.accumulated.clone(),
                outcome,
            );
            self.report = Some(report);
        }
        Some(delta)
    }

    /// Drain the remaining deltas and return the report.
    pub async fn finish(mut self) -> TurnReport {
        while self.next().await.is_some() {}
        match self.report.take() {
            Some(report) => report,
            None => {
                let accumulated = self.deltas.accumulated().to_string();
                self.orchestrator.persist_turn(
                    &self.user,
                    &self.decision,
                    &self.handler,
                    accumulated,
                    StreamOutcome::TimedOut,
                )
            }
        }
    }

    /// Adapt into a [`futures::Stream`] of deltas.
    pub fn into_stream(self) -> impl Stream<Item = StreamDelta> + Send {
        futures::stream::unfold(self, |mut turn| async move {
            turn.next().await.map(|delta| (delta, turn))
        })
    }
}
