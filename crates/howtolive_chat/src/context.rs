//! Application context.
//!
//! Built once at startup and passed by reference. It owns the three resource
//! tiers:
//!
//! - process: shared clients resolved once through [`ProcessTier`]
//! - user: one bundle per account, built on first use and then reused
//! - request: handlers and the orchestrator, rebuilt for every message
//!
//! What goes into each tier is decided by a [`HandlerFactory`].

use std::sync::Arc;

use async_trait::async_trait;
use howtolive_core::{ProcessTier, TeardownReport, UserTier};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::ChatResult;
use crate::orchestrator::{Orchestrator, TurnHandlers, TurnReport, TurnStream};
use crate::persistence::SessionStore;
use crate::snapshot::SnapshotPolicy;
use crate::stream::StreamOptions;
use crate::types::{SessionKey, UserKey};

/// Builds the resources of each tier.
#[async_trait]
pub trait HandlerFactory: Send + Sync + 'static {
    /// Process-wide bundle.
    type Shared: Send + Sync + 'static;
    /// Per-user bundle.
    type PerUser: Send + Sync + 'static;

    /// Resolve shared resources. Must not fail: unavailable resources are
    /// left out of the bundle.
    async fn init_shared(&self, tier: &ProcessTier, config: &AppConfig) -> Self::Shared;

    /// Build the bundle for one user.
    async fn init_user(&self, shared: &Self::Shared, user: &UserKey) -> ChatResult<Self::PerUser>;

    /// Build fresh handlers for one request.
    fn build(
        &self,
        config: &AppConfig,
        shared: &Self::Shared,
        user: &Self::PerUser,
    ) -> TurnHandlers;
}

/// Explicit replacement for process-global state.
pub struct AppContext<F: HandlerFactory> {
    config: AppConfig,
    store: SessionStore,
    process: ProcessTier,
    factory: F,
    shared: F::Shared,
    users: UserTier<F::PerUser>,
}

impl<F: HandlerFactory> AppContext<F> {
    /// Resolve the process tier and open the session store.
    pub async fn start(config: AppConfig, factory: F) -> Self {
        let process = ProcessTier::new();
        let shared = factory.init_shared(&process, &config).await;
        let store = SessionStore::with_policy(
            &config.sessions.root,
            SnapshotPolicy::from(&config.sessions),
        );

        info!(
            root = %config.sessions.root.display(),
            specialists = config.specialists.len(),
            resources = ?process.names(),
            "Application context started"
        );

        Self {
            config,
            store,
            process,
            factory,
            shared,
            users: UserTier::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn process_tier(&self) -> &ProcessTier {
        &self.process
    }

    pub fn shared(&self) -> &F::Shared {
        &self.shared
    }

    pub fn users(&self) -> &UserTier<F::PerUser> {
        &self.users
    }

    /// Per-user bundle, built on first access.
    pub async fn user_resources(&self, user: &UserKey) -> ChatResult<Arc<F::PerUser>> {
        let resources = self
            .users
            .get_or_create(&user.canonical(), || async {
                debug!(user = %user, "Building user resources");
                self.factory
                    .init_user(&self.shared, user)
                    .await
                    .map_err(Into::into)
            })
            .await?;
        Ok(resources)
    }

    /// Orchestrator for one request with prior state restored.
    pub async fn orchestrator(&self, key: &SessionKey) -> ChatResult<Orchestrator> {
        key.validate()?;
        let user = self.user_resources(&key.user).await?;
        let handlers = self.factory.build(&self.config, &self.shared, &user);

        let orchestrator = Orchestrator::new(
            key.clone(),
            self.store.clone(),
            self.config.routing_schema(),
            handlers,
            StreamOptions::from(&self.config.streaming),
        );
        orchestrator.restore();
        Ok(orchestrator)
    }

    /// Start a streamed turn.
    pub async fn stream_message(&self, key: &SessionKey, text: &str) -> ChatResult<TurnStream> {
        let orchestrator = self.orchestrator(key).await?;
        Ok(orchestrator.stream_turn(text).await)
    }

    /// Run a turn to completion.
    pub async fn send_message(&self, key: &SessionKey, text: &str) -> ChatResult<TurnReport> {
        let orchestrator = self.orchestrator(key).await?;
        Ok(orchestrator.handle(text).await)
    }

    /// Close process resources and drop user bundles.
    pub async fn shutdown(&self) -> TeardownReport {
        let report = self.process.teardown().await;
        self.users.clear();
        info!(
            closed = report.closed.len(),
            failed = report.failed.len(),
            "Application context shut down"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use howtolive_core::mock::{ScriptedClassifier, ScriptedHandler};
    use howtolive_core::CoreError;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CountingFactory {
        user_builds: Arc<AtomicUsize>,
        request_builds: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl HandlerFactory for CountingFactory {
        type Shared = Option<Arc<String>>;
        type PerUser = String;

        async fn init_shared(&self, tier: &ProcessTier, _config: &AppConfig) -> Self::Shared {
            tier.resolve("greeting", || async { Ok::<_, CoreError>("hello".to_string()) })
                .await
        }

        async fn init_user(&self, _shared: &Self::Shared, user: &UserKey) -> ChatResult<String> {
            self.user_builds.fetch_add(1, Ordering::SeqCst);
            Ok(user.display_name.clone())
        }

        fn build(&self, _config: &AppConfig, _shared: &Self::Shared, user: &String) -> TurnHandlers {
            self.request_builds.fetch_add(1, Ordering::SeqCst);
            TurnHandlers::new(
                Arc::new(ScriptedClassifier::routing_to("howtocook")),
                Arc::new(ScriptedHandler::replying("general", format!("hi {}", user))),
            )
            .with_specialist(Arc::new(ScriptedHandler::replying("howtocook", "Try lentils.")))
        }
    }

    fn config(root: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.sessions.root = root.to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_user_tier_reused_and_handlers_rebuilt() {
        let dir = tempdir().unwrap();
        let factory = CountingFactory::default();
        let user_builds = factory.user_builds.clone();
        let request_builds = factory.request_builds.clone();
        let ctx = AppContext::start(config(dir.path()), factory).await;
        assert!(ctx.shared().is_some());

        let user = UserKey::new("1", "alice").unwrap();
        let key = SessionKey::generate(user.clone());
        ctx.send_message(&key, "dinner?").await.unwrap();
        ctx.send_message(&key, "and lunch?").await.unwrap();

        assert_eq!(user_builds.load(Ordering::SeqCst), 1);
        assert_eq!(request_builds.load(Ordering::SeqCst), 2);
        assert!(ctx.users().contains(&user.canonical()));
    }

    #[tokio::test]
    async fn test_send_message_persists_turn() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::start(config(dir.path()), CountingFactory::default()).await;
        let key = SessionKey::generate(UserKey::new("1", "alice").unwrap());

        let report = ctx.send_message(&key, "dinner?").await.unwrap();
        assert!(report.persisted);
        assert_eq!(report.handler, "howtocook");
        assert_eq!(ctx.store().load_timeline(&key).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_clears_user_tier() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::start(config(dir.path()), CountingFactory::default()).await;
        let user = UserKey::new("1", "alice").unwrap();
        ctx.user_resources(&user).await.unwrap();
        assert_eq!(ctx.users().len(), 1);

        let report = ctx.shutdown().await;
        assert!(report.is_clean());
        assert!(ctx.users().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let dir = tempdir().unwrap();
        let ctx = AppContext::start(config(dir.path()), CountingFactory::default()).await;
        let user = UserKey::new("1", "alice").unwrap();
        let key = SessionKey {
            user,
            session_id: "../escape".to_string(),
        };
        assert!(ctx.send_message(&key, "hi").await.is_err());
    }
}
