//! Resource lifetime tiers.
//!
//! - **Process**: shared infrastructure built at most once. A failed build
//!   disables the feature for the rest of the process instead of failing startup.
//! - **User**: cached per user key until shutdown, built at most once per key.
//! - **Request**: handlers and orchestrators, rebuilt every turn and never cached
//!   here.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::CoreResult;

/// Lifetime scope of a cached resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Process,
    User,
    Request,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::User => write!(f, "user"),
            Self::Request => write!(f, "request"),
        }
    }
}

/// A resource holding connections that must be released at shutdown.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Closeable: Send + Sync {
    async fn close(&self) -> CoreResult<()>;
}

type AnyResource = Arc<dyn Any + Send + Sync>;

/// Result of a process-tier teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Names closed successfully, in close order
    pub closed: Vec<String>,
    /// Names whose close failed, with the error text
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Process-wide resources, built at most once per name.
#[derive(Default)]
pub struct ProcessTier {
    entries: Mutex<HashMap<String, Arc<OnceCell<Option<AnyResource>>>>>,
    closeables: Mutex<Vec<(String, Arc<dyn Closeable>)>>,
}

impl fmt::Debug for ProcessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTier")
            .field("names", &self.names())
            .finish()
    }
}

impl ProcessTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a process-wide resource, building it on first use.
    ///
    /// Returns `None` if the build failed, now or on any earlier call.
    pub async fn resolve<T, F, Fut>(&self, name: &str, factory: F) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.resolve_with(name, factory, |_| {}).await
    }

    /// Like [`ProcessTier::resolve`], and registers the resource for teardown.
    pub async fn resolve_closeable<T, F, Fut>(&self, name: &str, factory: F) -> Option<Arc<T>>
    where
        T: Closeable + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.resolve_with(name, factory, |resource: &Arc<T>| {
            let closeable: Arc<dyn Closeable> = resource.clone();
            self.closeables.lock().push((name.to_string(), closeable));
        })
        .await
    }

    async fn resolve_with<T, F, Fut, R>(&self, name: &str, factory: F, on_created: R) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
        R: FnOnce(&Arc<T>),
    {
        let cell = self.entries.lock().entry(name.to_string()).or_default().clone();

        let entry = cell
            .get_or_init(|| async {
                match factory().await {
                    Ok(resource) => {
                        let resource = Arc::new(resource);
                        on_created(&resource);
                        info!(tier = %Tier::Process, resource = name, "Resource initialized");
                        Some(resource as AnyResource)
                    }
                    Err(e) => {
                        warn!(
                            tier = %Tier::Process,
                            resource = name,
                            error = %e,
                            "Resource init failed, feature disabled"
                        );
                        None
                    }
                }
            })
            .await;

        let resource = entry.clone()?;
        match resource.downcast::<T>() {
            Ok(typed) => Some(typed),
            Err(_) => {
                warn!(tier = %Tier::Process, resource = name, "Resource resolved with a different type");
                None
            }
        }
    }

    /// Whether a build was attempted for `name` and failed.
    pub fn is_disabled(&self, name: &str) -> bool {
        self.entries
            .lock()
            .get(name)
            .and_then(|cell| cell.get().map(Option::is_none))
            .unwrap_or(false)
    }

    /// Names of live resources, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, cell)| matches!(cell.get(), Some(Some(_))))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Close registered resources in reverse registration order.
    ///
    /// Close failures are logged and collected; the remaining resources are
    /// still closed. Calling this again is a no-op.
    pub async fn teardown(&self) -> TeardownReport {
        let closeables = std::mem::take(&mut *self.closeables.lock());
        let mut report = TeardownReport::default();

        for (name, resource) in closeables.into_iter().rev() {
            match resource.close().await {
                Ok(()) => {
                    debug!(tier = %Tier::Process, resource = %name, "Resource closed");
                    report.closed.push(name);
                }
                Err(e) => {
                    warn!(tier = %Tier::Process, resource = %name, error = %e, "Resource close failed");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        report
    }
}

/// Per-user cache. Each key is built at most once; failed builds are retried
/// on the next access.
pub struct UserTier<T> {
    cells: Mutex<HashMap<String, Arc<OnceCell<Arc<T>>>>>,
}

impl<T> Default for UserTier<T> {
    fn default() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Send + Sync> fmt::Debug for UserTier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserTier").field("len", &self.len()).finish()
    }
}

impl<T: Send + Sync> UserTier<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached resource for `key`, building it if absent.
    ///
    /// Concurrent first accesses for the same key wait on the same build.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> CoreResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let cell = self.cells.lock().entry(key.to_string()).or_default().clone();

        let resource = cell
            .get_or_try_init(|| async {
                let resource = factory().await?;
                info!(tier = %Tier::User, user = key, "User resources initialized");
                Ok::<_, crate::error::CoreError>(Arc::new(resource))
            })
            .await?;

        Ok(resource.clone())
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.cells.lock().get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of initialized entries.
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        let count = {
            let mut cells = self.cells.lock();
            let count = cells.len();
            cells.clear();
            count
        };
        debug!(tier = %Tier::User, count, "User tier cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Registry {
        tools: Vec<String>,
    }

    #[tokio::test]
    async fn test_process_resolve_runs_factory_once() {
        let tier = ProcessTier::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let registry = tier
                .resolve("tools", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Registry {
                        tools: vec!["search".to_string()],
                    })
                })
                .await
                .unwrap();
            assert_eq!(registry.tools, vec!["search"]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tier.names(), vec!["tools"]);
    }

    #[tokio::test]
    async fn test_process_failure_disables_feature() {
        let tier = ProcessTier::new();
        let calls = AtomicUsize::new(0);

        let first: Option<Arc<Registry>> = tier
            .resolve("knowledge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::ResourceUnavailable("no endpoint".into()))
            })
            .await;
        assert!(first.is_none());
        assert!(tier.is_disabled("knowledge"));

        let second: Option<Arc<Registry>> = tier
            .resolve("knowledge", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Registry { tools: Vec::new() })
            })
            .await;
        assert!(second.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(tier.names().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_reverse_order_tolerates_failures() {
        let tier = ProcessTier::new();
        let mut seq = Sequence::new();

        let mut first = MockCloseable::new();
        let mut second = MockCloseable::new();
        let mut third = MockCloseable::new();

        third
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        second
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(CoreError::Close("socket already gone".into())));
        first
            .expect_close()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        tier.resolve_closeable("first", || async { Ok(first) }).await.unwrap();
        tier.resolve_closeable("second", || async { Ok(second) }).await.unwrap();
        tier.resolve_closeable("third", || async { Ok(third) }).await.unwrap();

        let report = tier.teardown().await;
        assert_eq!(report.closed, vec!["third", "first"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "second");
        assert!(!report.is_clean());

        let again = tier.teardown().await;
        assert_eq!(again, TeardownReport::default());
    }

    #[tokio::test]
    async fn test_user_tier_reuses_per_key() {
        let tier: UserTier<String> = UserTier::new();

        let a1 = tier
            .get_or_create("1_alice", || async { Ok("alice-memory".to_string()) })
            .await
            .unwrap();
        let a2 = tier
            .get_or_create("1_alice", || async { Ok("replacement".to_string()) })
            .await
            .unwrap();
        let b = tier
            .get_or_create("2_bob", || async { Ok("bob-memory".to_string()) })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(*a2, "alice-memory");
        assert_eq!(tier.len(), 2);
        assert_eq!(format!("{:?}", tier), "UserTier { len: 2 }");

        tier.clear();
        assert!(tier.is_empty());
        assert!(!tier.contains("1_alice"));
    }

    #[tokio::test]
    async fn test_user_tier_failure_not_cached() {
        let tier: UserTier<u32> = UserTier::new();

        let err = tier
            .get_or_create("1_alice", || async {
                Err(CoreError::ResourceUnavailable("memory service".into()))
            })
            .await;
        assert!(err.is_err());
        assert!(!tier.contains("1_alice"));

        let ok = tier.get_or_create("1_alice", || async { Ok(7) }).await.unwrap();
        assert_eq!(*ok, 7);
    }

    #[tokio::test]
    async fn test_user_tier_concurrent_first_access_builds_once() {
        let tier = Arc::new(UserTier::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let tier = tier.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                tier.get_or_create("1_alice", || async move {
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(calls.fetch_add(1, Ordering::SeqCst))
                })
                .await
                .unwrap()
            }));
        }

        let results = futures::future::join_all(tasks).await;
        let first = results[0].as_ref().unwrap().clone();
        for result in &results {
            assert!(Arc::ptr_eq(result.as_ref().unwrap(), &first));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
