use crate::error::Error;
use crate::options::QueueCoordinatorOptions;
use crate::{LivenessStore, QueueCoordinator};

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Coordinator that treats nodes with old heartbeats as gone.
///
/// Each registered event type gets its own renewal task. The tasks are
/// cancelled together and awaited on [`QueueCoordinator::shutdown`].
pub struct StaleNodeCoordinator<S>
where
    S: LivenessStore,
{
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    store: Arc<S>,
    key_prefix: String,
    node_name: String,
    stale_threshold: Duration,
    renew_interval: Duration,
    renewals: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<S> Drop for Inner<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<S> Clone for StaleNodeCoordinator<S>
where
    S: LivenessStore,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> Debug for StaleNodeCoordinator<S>
where
    S: LivenessStore,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaleNodeCoordinator")
            .field("key_prefix", &self.inner.key_prefix)
            .field("node_name", &self.inner.node_name)
            .field("stale_threshold", &self.inner.stale_threshold)
            .field("renew_interval", &self.inner.renew_interval)
            .finish_non_exhaustive()
    }
}

impl<S> StaleNodeCoordinator<S>
where
    S: LivenessStore,
{
    /// Creates a coordinator over `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid or no node name is
    /// configured and the host name cannot be read.
    pub fn new(options: QueueCoordinatorOptions, store: S) -> Result<Self, Error<S::Error>> {
        options.validate().map_err(Error::InvalidOptions)?;

        let QueueCoordinatorOptions {
            key_prefix,
            node_name,
            stale_threshold,
            renew_interval,
        } = options;

        let node_name = match node_name {
            Some(node_name) => node_name,
            None => hostname::get()
                .map_err(|e| Error::NodeName(e.to_string()))?
                .into_string()
                .map_err(|name| Error::NodeName(format!("{name:?} is not valid UTF-8")))?,
        };

        Ok(Self {
            inner: Arc::new(Inner {
                store: Arc::new(store),
                key_prefix,
                node_name,
                stale_threshold,
                renew_interval,
                renewals: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// The name this node advertises itself with.
    #[must_use]
    pub fn node_name(&self) -> &str {
        &self.inner.node_name
    }

    /// The store key holding heartbeats for `event_type`.
    #[must_use]
    pub fn key(&self, event_type: &str) -> String {
        format!("{}:{event_type}", self.inner.key_prefix)
    }

    /// Event types this node currently advertises.
    #[must_use]
    pub fn registered_events(&self) -> Vec<String> {
        let mut event_types: Vec<String> = self.inner.renewals.lock().keys().cloned().collect();
        event_types.sort();
        event_types
    }

    /// Stops advertising `event_type`. The last heartbeat stays in the store
    /// and ages out after the stale threshold.
    ///
    /// Returns `false` if the type was not registered.
    pub fn deregister_supported_event(&self, event_type: &str) -> bool {
        let Some(token) = self.inner.renewals.lock().remove(event_type) else {
            return false;
        };

        token.cancel();
        debug!(event_type, "stopped advertising event type");

        true
    }

    async fn heartbeat(
        store: Arc<S>,
        key: String,
        node_name: String,
        interval: Duration,
        token: CancellationToken,
        first_heartbeat: oneshot::Sender<Result<(), S::Error>>,
    ) {
        let written = store.renew(&key, &node_name, Utc::now().timestamp()).await;
        let renew = written.is_ok();
        let _ = first_heartbeat.send(written);

        if !renew {
            return;
        }

        Self::renew_loop(store, key, node_name, interval, token).await;
    }

    async fn renew_loop(
        store: Arc<S>,
        key: String,
        node_name: String,
        interval: Duration,
        token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            if let Err(error) = store.renew(&key, &node_name, Utc::now().timestamp()).await {
                warn!(%key, %error, "failed to renew heartbeat");
            }
        }

        debug!(%key, "stopped renewing heartbeat");
    }
}

#[async_trait]
impl<S> QueueCoordinator for StaleNodeCoordinator<S>
where
    S: LivenessStore,
{
    type Error = Error<S::Error>;

    async fn register_supported_event(&self, event_type: &str) -> Result<(), Self::Error> {
        let key = self.key(event_type);

        // Spawned under the arena lock: `shutdown` either waits on the task
        // or registration sees the cancelled token.
        let first_heartbeat = {
            let mut renewals = self.inner.renewals.lock();

            if self.inner.shutdown.is_cancelled() {
                return Err(Error::ShutDown);
            }

            if renewals.contains_key(event_type) {
                debug!(event_type, "event type already registered");
                return Ok(());
            }

            let token = self.inner.shutdown.child_token();
            renewals.insert(event_type.to_string(), token.clone());

            let (sender, first_heartbeat) = oneshot::channel();
            self.inner.tracker.spawn(Self::heartbeat(
                self.inner.store.clone(),
                key,
                self.inner.node_name.clone(),
                self.inner.renew_interval,
                token,
                sender,
            ));

            first_heartbeat
        };

        let written = first_heartbeat.await;

        if self.inner.shutdown.is_cancelled() {
            self.inner.renewals.lock().remove(event_type);
            return Err(Error::ShutDown);
        }

        match written {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                self.inner.renewals.lock().remove(event_type);
                return Err(Error::Store(error));
            }
            Err(_) => {
                self.inner.renewals.lock().remove(event_type);
                return Err(Error::ShutDown);
            }
        }

        info!(event_type, node = %self.inner.node_name, "advertising supported event");

        Ok(())
    }

    async fn is_event_supported(&self, event_type: &str) -> Result<bool, Self::Error> {
        let key = self.key(event_type);
        let now = Utc::now().timestamp();

        let live = self
            .inner
            .store
            .count_live(&key, now, self.inner.stale_threshold)
            .await
            .map_err(Error::Store)?;

        debug!(event_type, live, "checked event support");

        Ok(live > 0)
    }

    async fn shutdown(&self) {
        {
            let _renewals = self.inner.renewals.lock();
            self.inner.shutdown.cancel();
        }


        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.renewals.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LivenessStoreError, live_since};

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use tokio::sync::Notify;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    #[derive(Debug, thiserror::Error)]
    #[error("store unavailable")]
    struct TestStoreError;

    impl LivenessStoreError for TestStoreError {}

    #[derive(Clone, Default)]
    struct TestStore {
        scores: Arc<Mutex<HashMap<String, HashMap<String, i64>>>>,
        renewals: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
    }

    impl TestStore {
        fn set(&self, key: &str, node: &str, score: i64) {
            self.scores
                .lock()
                .entry(key.to_string())
                .or_default()
                .insert(node.to_string(), score);
        }

        fn score(&self, key: &str, node: &str) -> Option<i64> {
            self.scores.lock().get(key)?.get(node).copied()
        }

        fn renewals(&self) -> usize {
            self.renewals.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LivenessStore for TestStore {
        type Error = TestStoreError;

        async fn renew(&self, key: &str, node: &str, now: i64) -> Result<(), Self::Error> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TestStoreError);
            }

            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.set(key, node, now);

            Ok(())
        }

        async fn count_live(
            &self,
            key: &str,
            now: i64,
            threshold: Duration,
        ) -> Result<u64, Self::Error> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TestStoreError);
            }

            let since = live_since(now, threshold);

            Ok(self
                .scores
                .lock()
                .get(key)
                .map_or(0, |members| {
                    members.values().filter(|score| **score > since).count() as u64
                }))
        }
    }

    /// Holds every heartbeat write until released.
    #[derive(Clone, Default)]
    struct GatedStore {
        inner: TestStore,
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl LivenessStore for GatedStore {
        type Error = TestStoreError;

        async fn renew(&self, key: &str, node: &str, now: i64) -> Result<(), Self::Error> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.renew(key, node, now).await
        }

        async fn count_live(
            &self,
            key: &str,
            now: i64,
            threshold: Duration,
        ) -> Result<u64, Self::Error> {
            self.inner.count_live(key, now, threshold).await
        }
    }

    fn options(renew_interval: Duration) -> QueueCoordinatorOptions {
        QueueCoordinatorOptions {
            key_prefix: "polybus".to_string(),
            node_name: Some("node-a".to_string()),
            stale_threshold: Duration::from_secs(60),
            renew_interval,
        }
    }

    #[tokio::test]
    async fn test_register_writes_heartbeat() {
        let store = TestStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_secs(30)), store.clone()).unwrap();

        assert!(!coordinator.is_event_supported("orders.Placed").await.unwrap());

        coordinator
            .register_supported_event("orders.Placed")
            .await
            .unwrap();

        let score = store.score("polybus:orders.Placed", "node-a").unwrap();
        assert!((Utc::now().timestamp() - score).abs() <= 1);
        assert!(coordinator.is_event_supported("orders.Placed").await.unwrap());
        assert!(!coordinator.is_event_supported("orders.Shipped").await.unwrap());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let store = TestStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_secs(30)), store.clone()).unwrap();

        coordinator.register_supported_event("a").await.unwrap();
        coordinator.register_supported_event("a").await.unwrap();
        coordinator.register_supported_event("b").await.unwrap();

        assert_eq!(store.renewals(), 2);
        assert_eq!(coordinator.registered_events(), vec!["a", "b"]);

        coordinator.shutdown().await;
        assert!(coordinator.registered_events().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeats_are_renewed_until_shutdown() {
        let store = TestStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_millis(20)), store.clone()).unwrap();

        coordinator.register_supported_event("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let renewed = store.renewals();
        assert!(renewed >= 3, "only {renewed} renewals");

        coordinator.shutdown().await;
        let after_shutdown = store.renewals();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(store.renewals(), after_shutdown);
        assert_matches!(
            coordinator.register_supported_event("b").await,
            Err(Error::ShutDown)
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_registration() {
        let store = GatedStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_secs(30)), store.clone()).unwrap();

        let registering = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.register_supported_event("a").await }
        });
        store.entered.notified().await;

        let shutting_down = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!shutting_down.is_finished());
        assert_eq!(store.inner.renewals(), 0);

        store.release.notify_one();
        timeout(Duration::from_secs(1), shutting_down)
            .await
            .unwrap()
            .unwrap();

        // Nothing is written once shutdown has returned.
        let written = store.inner.renewals();
        assert_eq!(written, 1);
        assert_matches!(registering.await.unwrap(), Err(Error::ShutDown));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.inner.renewals(), written);
        assert!(coordinator.registered_events().is_empty());
    }

    #[tokio::test]
    async fn test_deregister_stops_one_renewal() {
        let store = TestStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_millis(20)), store.clone()).unwrap();

        coordinator.register_supported_event("a").await.unwrap();
        coordinator.register_supported_event("b").await.unwrap();

        assert!(coordinator.deregister_supported_event("a"));
        assert!(!coordinator.deregister_supported_event("a"));

        let a = store.score("polybus:a", "node-a");
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert_eq!(store.score("polybus:a", "node-a"), a);
        assert!(store.score("polybus:b", "node-a") > a);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_nodes_are_ignored() {
        let store = TestStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_secs(30)), store.clone()).unwrap();
        let now = Utc::now().timestamp();

        store.set("polybus:a", "node-b", now - 600);
        store.set("polybus:a", "node-c", now - 61);
        assert!(!coordinator.is_event_supported("a").await.unwrap());

        store.set("polybus:a", "node-d", now - 10);
        assert!(coordinator.is_event_supported("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_registration_can_be_retried() {
        let store = TestStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_secs(30)), store.clone()).unwrap();

        store.failing.store(true, Ordering::SeqCst);
        assert_matches!(
            coordinator.register_supported_event("a").await,
            Err(Error::Store(TestStoreError))
        );
        assert_matches!(
            coordinator.is_event_supported("a").await,
            Err(Error::Store(_))
        );
        assert!(coordinator.registered_events().is_empty());

        store.failing.store(false, Ordering::SeqCst);
        coordinator.register_supported_event("a").await.unwrap();
        assert_eq!(coordinator.registered_events(), vec!["a"]);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_renewal_failure_is_not_fatal() {
        let store = TestStore::default();
        let coordinator =
            StaleNodeCoordinator::new(options(Duration::from_millis(20)), store.clone()).unwrap();

        coordinator.register_supported_event("a").await.unwrap();
        store.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(logs_contain("failed to renew heartbeat"));

        store.failing.store(false, Ordering::SeqCst);
        let before = store.renewals();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.renewals() > before);

        coordinator.shutdown().await;
    }

    #[test]
    fn test_node_name_defaults_to_host_name() {
        let mut options = options(Duration::from_secs(30));
        options.node_name = None;

        let coordinator = StaleNodeCoordinator::new(options, TestStore::default()).unwrap();
        let host = hostname::get().unwrap().into_string().unwrap();

        assert_eq!(coordinator.node_name(), host);
        assert_eq!(coordinator.key("x"), "polybus:x");
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let mut options = options(Duration::from_secs(30));
        options.renew_interval = Duration::from_secs(120);

        assert_matches!(
            StaleNodeCoordinator::new(options, TestStore::default()),
            Err(Error::InvalidOptions(_))
        );
    }
}
