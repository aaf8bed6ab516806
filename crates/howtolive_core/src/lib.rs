//! # howtolive_core
//!
//! Contracts shared by every part of howtolive.
//!
//! # Architecture
//!
//! - **Message**: a single reply type with explicit content blocks and `text()`
//! - **Memory**: the ordered history each handler owns
//! - **Handler / Classifier**: async contracts with named observation hooks
//! - **Routing**: the decision a classifier returns and the schema constraining it
//! - **Tier**: process-wide and per-user resource caches
//!
//! # Example
//!
//! ```rust,ignore
//! use howtolive_core::{Handler, Message, message_hook};
//!
//! handler.register_hook("printer", message_hook(|m: Message| async move {
//!     println!("{}", m.text());
//! }));
//! let reply = handler.reply(&Message::user("How long should I sleep?")).await?;
//! handler.unregister_hook("printer");
//! ```

pub mod error;
pub mod handler;
pub mod memory;
pub mod message;
pub mod mock;
pub mod routing;
pub mod tier;

// Re-export main types for convenience
pub use error::{CoreError, CoreResult};
pub use handler::{
    message_hook, AsStateful, Classifier, ClassifierOutput, Handler, HookRegistry, MessageHook, Stateful,
};
pub use memory::ConversationMemory;
pub use message::{ContentBlock, Message, Role};
pub use routing::{RoutingDecision, RoutingSchema};
pub use tier::{Closeable, ProcessTier, TeardownReport, Tier, UserTier};
