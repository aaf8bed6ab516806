//! # howtolive_chat - Turn orchestration and session persistence
//!
//! This crate turns a user message into a routed, streamed and persisted
//! conversation turn:
//!
//! - **Dispatch**: one classifier call picks a specialist label or `general`
//! - **Streaming**: handler emissions become ordered text deltas with an idle
//!   timeout and exactly one final delta
//! - **Persistence**: per-session state snapshots and an append-only
//!   timeline, written atomically
//! - **Resource tiers**: process-wide clients, per-user bundles and
//!   per-request handlers held by an explicit [`AppContext`]
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  AppContext  │────▶│ Orchestrator │────▶│   Dispatch   │
//! └──────────────┘     └──────┬───────┘     └──────────────┘
//!                             │
//!               ┌─────────────┼─────────────┐
//!               ▼             ▼             ▼
//!        ┌────────────┐ ┌────────────┐ ┌────────────┐
//!        │  general   │ │ howtocook  │ │    ...     │
//!        └─────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!              └──────────────┼──────────────┘
//!                             ▼
//!                   ┌──────────────────┐
//!                   │ Streaming bridge │──▶ deltas
//!                   └────────┬─────────┘
//!                            ▼
//!                   ┌──────────────────┐
//!                   │  Session store   │  state.json + timeline.json
//!                   └──────────────────┘
//! ```

pub mod agents;
pub mod atomic;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod layout;
pub mod llm;
pub mod orchestrator;
pub mod persistence;
pub mod snapshot;
pub mod stream;
pub mod types;

pub use agents::{
    CannedHandler, DefaultHandlerFactory, KeywordClassifier, SharedResources, UserProfile,
    GENERAL_HANDLER,
};
pub use config::{AppConfig, LlmConfig, SessionsConfig, SpecialistConfig, StreamingConfig};
pub use context::{AppContext, HandlerFactory};
pub use dispatch::DispatchClassifier;
pub use error::{ChatError, ChatResult, StoreError, StoreResult};
pub use layout::SessionLayout;
pub use llm::{LlmClassifier, LlmClient, LlmHandler, ROUTER_NAME};
pub use orchestrator::{Orchestrator, TurnHandlers, TurnReport, TurnState, TurnStream};
pub use persistence::SessionStore;
pub use snapshot::{SnapshotMode, SnapshotPolicy};
pub use stream::{stream_reply, DeltaStream, StreamDelta, StreamOptions, StreamOutcome};
pub use types::{
    EventType, SessionDetail, SessionKey, SessionMeta, SessionSummary, TimelineEvent, UserKey,
};
