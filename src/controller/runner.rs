//! Controller
//!
//! Bridges cache events into two work queues and drives one sync loop per
//! queue.
//!
//! ```text
//!  Storage cache ──┐                        ┌──▶ storage queue ──▶ StorageReconciler
//!                  ├──▶ ResourceEvent ──▶ route
//!  Claim cache ────┘    (owned claims only) └──▶ claim queue ────▶ ClaimReconciler
//! ```
//!
//! Workers only start once every cache reports synced. Each sync step
//! releases its key before deciding on a requeue, so a key is never stuck
//! in the processing set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::common::{is_owned_by_storage, storage_owner_name};
use super::keys::QueueKey;
use crate::crd::Storage;
use crate::domain::ports::{CacheEvent, ObjectCache, Reconcile};
use crate::error::{Error, Result};
use crate::metrics::{ControllerMetrics, ReconcileResult};
use crate::queue::RateLimitingQueue;

/// Default controller name
pub const DEFAULT_NAME: &str = "StorageController";

const CACHE_SYNC_POLL: Duration = Duration::from_millis(100);

/// Predicate reporting whether a cache finished its initial listing
pub type SyncedFn = Arc<dyn Fn() -> bool + Send + Sync>;

// =============================================================================
// Event routing
// =============================================================================

/// A cache event tagged with the kind it came from
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    Storage(CacheEvent<Storage>),
    Claim(CacheEvent<PersistentVolumeClaim>),
}

/// Turns cache events into queue keys
#[derive(Debug, Clone)]
struct EventRouter {
    name: String,
    storage_queue: RateLimitingQueue,
    claim_queue: RateLimitingQueue,
}

impl EventRouter {
    fn route(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::Storage(event) => {
                let storage = event.object();
                if let CacheEvent::Updated { old, new } = &event {
                    if is_status_only_change(old, new) {
                        debug!(
                            controller = %self.name,
                            storage = %QueueKey::for_object(storage.as_ref()),
                            "Ignoring status-only update"
                        );
                        return;
                    }
                }
                self.storage_queue
                    .add(&QueueKey::for_object(storage.as_ref()).encode());
            }
            ResourceEvent::Claim(event) => {
                let claim = event.object();
                if !is_owned_by_storage(claim) {
                    debug!(
                        controller = %self.name,
                        claim = %QueueKey::for_object(claim.as_ref()),
                        "Ignoring claim: Storage is not owner"
                    );
                    return;
                }
                self.claim_queue
                    .add(&QueueKey::for_object(claim.as_ref()).encode());

                // Let the owner refresh its status
                if let Some(owner) = storage_owner_name(claim) {
                    let namespace = claim.namespace().unwrap_or_default();
                    self.storage_queue
                        .add(&QueueKey::new(namespace, owner).encode());
                }
            }
        }
    }
}

/// Our own status writes must not wake the key they came from. Resyncs
/// deliver identical objects and still enqueue.
fn is_status_only_change(old: &Storage, new: &Storage) -> bool {
    old.status != new.status && old.spec == new.spec && old.annotations() == new.annotations()
}

// =============================================================================
// Sync loop
// =============================================================================

#[derive(Debug)]
enum SyncOutcome {
    Success,
    Skipped,
    NotFound,
    Failed(Error),
}

/// Releases a dequeued key, including when the sync step unwinds.
struct InFlight<'a> {
    queue: &'a RateLimitingQueue,
    key: &'a str,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(self.key);
    }
}

/// One queue, its cache and its reconciler
pub struct SyncLoop<K> {
    kind: &'static str,
    controller: String,
    queue: RateLimitingQueue,
    cache: Arc<dyn ObjectCache<K>>,
    reconciler: Arc<dyn Reconcile<K>>,
    metrics: Option<Arc<ControllerMetrics>>,
}

impl<K: Send + Sync + 'static> SyncLoop<K> {
    pub fn queue(&self) -> &RateLimitingQueue {
        &self.queue
    }

    /// Process one key. Returns `false` once the queue has shut down.
    pub async fn process_next(&self) -> bool {
        let Some(token) = self.queue.get().await else {
            return false;
        };

        let started = Instant::now();
        let outcome = {
            let _in_flight = InFlight {
                queue: &self.queue,
                key: &token,
            };
            self.sync(&token).await
        };
        self.finish(&token, outcome, started.elapsed());
        true
    }

    async fn sync(&self, token: &str) -> SyncOutcome {
        let key = QueueKey::decode(token);
        if !key.is_usable() {
            warn!(controller = %self.controller, kind = self.kind, token, "Dropping malformed queue key");
            return SyncOutcome::Skipped;
        }

        debug!(controller = %self.controller, kind = self.kind, key = %key, "Sync started");
        let obj = match self.cache.get(&key.namespace, &key.name) {
            Ok(obj) => obj,
            Err(e) if e.is_not_found() => return SyncOutcome::NotFound,
            Err(e) => return SyncOutcome::Failed(e),
        };

        // Only a missing cache entry is NotFound; errors from the reconcile
        // itself always back off
        match self.reconciler.reconcile(obj).await {
            Ok(()) => SyncOutcome::Success,
            Err(e) => SyncOutcome::Failed(e),
        }
    }

    fn finish(&self, token: &str, outcome: SyncOutcome, elapsed: Duration) {
        let result = match outcome {
            SyncOutcome::Success => {
                // Reset exponential backoff
                self.queue.forget(token);
                debug!(controller = %self.controller, kind = self.kind, token, "Sync completed");
                ReconcileResult::Success
            }
            SyncOutcome::Skipped => {
                self.queue.forget(token);
                ReconcileResult::Skipped
            }
            SyncOutcome::NotFound => {
                self.queue.forget(token);
                debug!(
                    controller = %self.controller,
                    kind = self.kind,
                    token,
                    "Sync ignored: object does not exist"
                );
                ReconcileResult::NotFound
            }
            SyncOutcome::Failed(err) => {
                error!(
                    controller = %self.controller,
                    kind = self.kind,
                    token,
                    category = err.category(),
                    error = %err,
                    "Sync failed: will re-queue"
                );
                self.queue.add_rate_limited(token);
                if let Some(metrics) = &self.metrics {
                    metrics.record_requeue(self.kind);
                }
                ReconcileResult::Error
            }
        };

        if let Some(metrics) = &self.metrics {
            metrics.record_reconcile(self.kind, result, elapsed);
        }
    }
}

impl<K> std::fmt::Debug for SyncLoop<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLoop")
            .field("kind", &self.kind)
            .field("queue", &self.queue)
            .finish()
    }
}

async fn run_worker<K: Send + Sync + 'static>(sync: Arc<SyncLoop<K>>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        if !sync.process_next().await {
            break;
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Collects the controller's collaborators.
///
/// Every cache, reconciler and queue is required;
/// [`initialize`](Self::initialize) fails with a configuration error
/// otherwise.
#[derive(Default)]
pub struct ControllerBuilder {
    name: Option<String>,
    storages: Option<Arc<dyn ObjectCache<Storage>>>,
    claims: Option<Arc<dyn ObjectCache<PersistentVolumeClaim>>>,
    storage_reconciler: Option<Arc<dyn Reconcile<Storage>>>,
    claim_reconciler: Option<Arc<dyn Reconcile<PersistentVolumeClaim>>>,
    storage_queue: Option<RateLimitingQueue>,
    claim_queue: Option<RateLimitingQueue>,
    wait_for: Vec<SyncedFn>,
    metrics: Option<Arc<ControllerMetrics>>,
    ready: Option<Arc<AtomicBool>>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn storage_cache(mut self, cache: Arc<dyn ObjectCache<Storage>>) -> Self {
        self.storages = Some(cache);
        self
    }

    pub fn claim_cache(mut self, cache: Arc<dyn ObjectCache<PersistentVolumeClaim>>) -> Self {
        self.claims = Some(cache);
        self
    }

    pub fn storage_reconciler(mut self, reconciler: Arc<dyn Reconcile<Storage>>) -> Self {
        self.storage_reconciler = Some(reconciler);
        self
    }

    pub fn claim_reconciler(mut self, reconciler: Arc<dyn Reconcile<PersistentVolumeClaim>>) -> Self {
        self.claim_reconciler = Some(reconciler);
        self
    }

    pub fn storage_queue(mut self, queue: RateLimitingQueue) -> Self {
        self.storage_queue = Some(queue);
        self
    }

    pub fn claim_queue(mut self, queue: RateLimitingQueue) -> Self {
        self.claim_queue = Some(queue);
        self
    }

    /// Also wait for `synced` before starting workers
    pub fn wait_for(mut self, synced: SyncedFn) -> Self {
        self.wait_for.push(synced);
        self
    }

    pub fn metrics(mut self, metrics: Arc<ControllerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Flag set once the caches synced and cleared on shutdown
    pub fn readiness(mut self, ready: Arc<AtomicBool>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Wire event handlers and build the controller.
    pub fn initialize(self) -> Result<Controller> {
        let name = self.name.unwrap_or_else(|| DEFAULT_NAME.to_string());
        let missing = |what: &str| Error::Config(format!("{}: Init failed: nil {}", name, what));

        let storages = self.storages.ok_or_else(|| missing("storage cache"))?;
        let claims = self.claims.ok_or_else(|| missing("claim cache"))?;
        let storage_reconciler = self
            .storage_reconciler
            .ok_or_else(|| missing("storage reconciler"))?;
        let claim_reconciler = self
            .claim_reconciler
            .ok_or_else(|| missing("claim reconciler"))?;
        let storage_queue = self.storage_queue.ok_or_else(|| missing("storage queue"))?;
        let claim_queue = self.claim_queue.ok_or_else(|| missing("claim queue"))?;

        let router = EventRouter {
            name: name.clone(),
            storage_queue: storage_queue.clone(),
            claim_queue: claim_queue.clone(),
        };
        {
            let router = router.clone();
            storages.add_event_handler(Arc::new(move |event: CacheEvent<Storage>| {
                router.route(ResourceEvent::Storage(event))
            }));
        }
        claims.add_event_handler(Arc::new(move |event: CacheEvent<PersistentVolumeClaim>| {
            router.route(ResourceEvent::Claim(event))
        }));

        let mut synced: Vec<SyncedFn> = Vec::with_capacity(2 + self.wait_for.len());
        {
            let storages = storages.clone();
            synced.push(Arc::new(move || storages.has_synced()));
        }
        {
            let claims = claims.clone();
            synced.push(Arc::new(move || claims.has_synced()));
        }
        synced.extend(self.wait_for);

        Ok(Controller {
            storage_loop: Arc::new(SyncLoop {
                kind: "Storage",
                controller: name.clone(),
                queue: storage_queue,
                cache: storages,
                reconciler: storage_reconciler,
                metrics: self.metrics.clone(),
            }),
            claim_loop: Arc::new(SyncLoop {
                kind: "PersistentVolumeClaim",
                controller: name.clone(),
                queue: claim_queue,
                cache: claims,
                reconciler: claim_reconciler,
                metrics: self.metrics,
            }),
            name,
            synced,
            ready: self.ready.unwrap_or_default(),
        })
    }
}

/// Runs the storage and claim sync loops
pub struct Controller {
    name: String,
    storage_loop: Arc<SyncLoop<Storage>>,
    claim_loop: Arc<SyncLoop<PersistentVolumeClaim>>,
    synced: Vec<SyncedFn>,
    ready: Arc<AtomicBool>,
}

impl Controller {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage_loop(&self) -> &SyncLoop<Storage> {
        &self.storage_loop
    }

    pub fn claim_loop(&self) -> &SyncLoop<PersistentVolumeClaim> {
        &self.claim_loop
    }

    /// Whether workers are running against synced caches
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Run `workers` loops per queue until `cancel` fires.
    ///
    /// Returns without starting workers when `cancel` fires before every
    /// cache has synced.
    pub async fn run(&self, workers: usize, cancel: CancellationToken) -> Result<()> {
        if workers == 0 {
            return Err(Error::Config(format!(
                "{}: worker count must be greater than zero",
                self.name
            )));
        }

        info!(controller = %self.name, workers, "Starting controller");

        if !self.wait_for_cache_sync(&cancel).await {
            error!(controller = %self.name, "Cannot sync caches");
            self.shut_down_queues();
            return Ok(());
        }
        info!(controller = %self.name, "Caches synced");
        self.ready.store(true, Ordering::SeqCst);

        let mut tasks = JoinSet::new();
        for _ in 0..workers {
            tasks.spawn(run_worker(self.storage_loop.clone(), cancel.clone()));
            tasks.spawn(run_worker(self.claim_loop.clone(), cancel.clone()));
        }

        cancel.cancelled().await;

        info!(controller = %self.name, "Shutting down controller");
        self.ready.store(false, Ordering::SeqCst);
        self.shut_down_queues();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(controller = %self.name, error = %e, "Worker terminated abnormally");
            }
        }
        info!(controller = %self.name, "Controller stopped");
        Ok(())
    }

    async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        let mut poll = tokio::time::interval(CACHE_SYNC_POLL);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = poll.tick() => {
                    if self.synced.iter().all(|synced| synced()) {
                        return true;
                    }
                }
            }
        }
    }

    fn shut_down_queues(&self) {
        self.storage_loop.queue.shut_down();
        self.claim_loop.queue.shut_down();
    }
}

impl std::fmt::Display for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.name)
            .field("storage_loop", &self.storage_loop)
            .field("claim_loop", &self.claim_loop)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryCache;
    use crate::crd::{StorageSpec, StoragePhase, StorageStatus};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    const BASE: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(4);

    /// Fails with the queued errors first, then succeeds
    #[derive(Default)]
    struct ScriptedReconciler {
        failures: Mutex<Vec<Error>>,
        calls: AtomicUsize,
    }

    impl ScriptedReconciler {
        fn failing(errors: Vec<Error>) -> Self {
            Self {
                failures: Mutex::new(errors),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<K: Send + Sync + 'static> Reconcile<K> for ScriptedReconciler {
        async fn reconcile(&self, _obj: Arc<K>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl Reconcile<Storage> for Panicking {
        async fn reconcile(&self, _obj: Arc<Storage>) -> Result<()> {
            panic!("reconciler bug");
        }
    }

    struct Fixture {
        storages: Arc<InMemoryCache<Storage>>,
        claims: Arc<InMemoryCache<PersistentVolumeClaim>>,
        storage_reconciler: Arc<ScriptedReconciler>,
        claim_reconciler: Arc<ScriptedReconciler>,
        metrics: Arc<ControllerMetrics>,
        controller: Controller,
    }

    fn fixture_with(storage_failures: Vec<Error>) -> Fixture {
        let storages = Arc::new(InMemoryCache::<Storage>::new("Storage"));
        let claims = Arc::new(InMemoryCache::<PersistentVolumeClaim>::new(
            "PersistentVolumeClaim",
        ));
        let storage_reconciler = Arc::new(ScriptedReconciler::failing(storage_failures));
        let claim_reconciler = Arc::new(ScriptedReconciler::default());
        let metrics = Arc::new(ControllerMetrics::new().unwrap());

        let controller = Controller::builder()
            .storage_cache(storages.clone())
            .claim_cache(claims.clone())
            .storage_reconciler(storage_reconciler.clone())
            .claim_reconciler(claim_reconciler.clone())
            .storage_queue(RateLimitingQueue::with_backoff("storage", BASE, MAX))
            .claim_queue(RateLimitingQueue::with_backoff("claim", BASE, MAX))
            .metrics(metrics.clone())
            .initialize()
            .unwrap();

        Fixture {
            storages,
            claims,
            storage_reconciler,
            claim_reconciler,
            metrics,
            controller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Vec::new())
    }

    fn storage(name: &str) -> Storage {
        let mut storage = Storage::new(
            name,
            StorageSpec {
                capacity: Quantity("1Gi".into()),
                node_name: None,
            },
        );
        storage.metadata.namespace = Some("ns".into());
        storage
    }

    fn claim(name: &str, owner_kind: &str, owner_api_version: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("ns".into()),
                owner_references: Some(vec![OwnerReference {
                    api_version: owner_api_version.into(),
                    kind: owner_kind.into(),
                    name: "data".into(),
                    uid: "uid".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn transient() -> Error {
        Error::Internal("apiserver unavailable".into())
    }

    // =========================================================================
    // initialize
    // =========================================================================

    #[test]
    fn test_initialize_requires_collaborators() {
        let err = Controller::builder().initialize().unwrap_err();
        assert_matches!(err, Error::Config(ref msg) if msg.contains("StorageController"));

        let err = Controller::builder()
            .name("test")
            .storage_cache(Arc::new(InMemoryCache::<Storage>::new("Storage")))
            .claim_cache(Arc::new(InMemoryCache::<PersistentVolumeClaim>::new(
                "PersistentVolumeClaim",
            )))
            .storage_reconciler(Arc::new(ScriptedReconciler::default()))
            .claim_reconciler(Arc::new(ScriptedReconciler::default()))
            .storage_queue(RateLimitingQueue::with_backoff("storage", BASE, MAX))
            .initialize()
            .unwrap_err();
        assert_matches!(err, Error::Config(ref msg) if msg.contains("claim queue"));
    }

    // =========================================================================
    // Event ingestion
    // =========================================================================

    #[test]
    fn test_storage_add_and_update_enqueue_once() {
        let f = fixture();
        f.storages.apply(storage("data"));
        f.storages.apply(storage("data"));

        assert_eq!(f.controller.storage_loop().queue().len(), 1);
    }

    #[tokio::test]
    async fn test_status_only_update_does_not_enqueue() {
        let f = fixture();
        let queue = f.controller.storage_loop().queue();
        f.storages.apply(storage("data"));
        assert_eq!(queue.get().await.as_deref(), Some("ns:data"));
        queue.done("ns:data");

        let mut failed = storage("data");
        failed.status = Some(StorageStatus {
            phase: StoragePhase::Failed,
            reason: Some("MissingAnnotation".into()),
            ..Default::default()
        });
        f.storages.apply(failed.clone());
        assert!(queue.is_empty());

        // Resync redelivers the same object and still enqueues
        f.storages.resync();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("ns:data"));
        queue.done("ns:data");

        failed.spec.capacity = Quantity("2Gi".into());
        f.storages.apply(failed);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_foreign_claims_are_dropped() {
        let f = fixture();
        f.claims.apply(claim("web-0", "StatefulSet", "apps/v1"));
        f.claims.apply(claim("old", "Storage", "ddp.mayadata.io/v1beta1"));
        f.claims.apply(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("orphan".into()),
                namespace: Some("ns".into()),
                ..Default::default()
            },
            ..Default::default()
        });

        assert!(f.controller.claim_loop().queue().is_empty());
        assert!(f.controller.storage_loop().queue().is_empty());
    }

    #[tokio::test]
    async fn test_owned_claim_enqueues_claim_and_owner() {
        let f = fixture();
        f.claims
            .apply(claim("ns-data-abcde", "Storage", "ddp.mayadata.io/v1alpha1"));

        let claim_queue = f.controller.claim_loop().queue();
        let storage_queue = f.controller.storage_loop().queue();
        assert_eq!(claim_queue.get().await.as_deref(), Some("ns:ns-data-abcde"));
        assert_eq!(storage_queue.get().await.as_deref(), Some("ns:data"));
    }

    // =========================================================================
    // Sync step
    // =========================================================================

    #[tokio::test]
    async fn test_success_forgets_key() {
        let f = fixture();
        f.storages.apply(storage("data"));

        assert!(f.controller.storage_loop().process_next().await);
        assert_eq!(f.storage_reconciler.calls(), 1);
        assert!(f.controller.storage_loop().queue().is_empty());
        assert_eq!(
            f.metrics.reconcile_count("Storage", ReconcileResult::Success),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_not_requeued() {
        let f = fixture();
        let queue = f.controller.storage_loop().queue();
        queue.add("ns:gone");

        assert!(f.controller.storage_loop().process_next().await);
        tokio::time::sleep(MAX * 2).await;

        assert!(queue.is_empty());
        assert_eq!(queue.num_requeues("ns:gone"), 0);
        assert_eq!(f.storage_reconciler.calls(), 0);
        assert_eq!(
            f.metrics.reconcile_count("Storage", ReconcileResult::NotFound),
            1
        );

        // Released: a fresh add is handed out again
        queue.add("ns:gone");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_key_is_skipped() {
        let f = fixture();
        let queue = f.controller.claim_loop().queue();
        queue.add("not-a-key");

        assert!(f.controller.claim_loop().process_next().await);
        assert!(queue.is_empty());
        assert_eq!(f.claim_reconciler.calls(), 0);
        assert_eq!(
            f.metrics
                .reconcile_count("PersistentVolumeClaim", ReconcileResult::Skipped),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_backs_off_then_resets() {
        let f = fixture_with(vec![transient(), transient(), transient(), transient()]);
        let sync = f.controller.storage_loop();
        let queue = sync.queue();
        f.storages.apply(storage("data"));

        // Delays 1s, 2s, 4s, then capped at 4s
        for (attempt, delay) in [BASE, BASE * 2, MAX, MAX].into_iter().enumerate() {
            assert!(sync.process_next().await);
            assert!(queue.is_empty(), "attempt {} requeued immediately", attempt);
            assert_eq!(queue.num_requeues("ns:data"), attempt as u32 + 1);

            tokio::time::sleep(delay - Duration::from_millis(1)).await;
            assert!(queue.is_empty(), "attempt {} requeued too early", attempt);
            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(queue.len(), 1, "attempt {} not requeued", attempt);
        }

        // Fifth attempt succeeds and resets the backoff
        assert!(sync.process_next().await);
        assert_eq!(queue.num_requeues("ns:data"), 0);
        assert_eq!(f.metrics.requeue_count("Storage"), 4);

        // A later failure starts from the initial interval again
        f.storage_reconciler.failures.lock().push(transient());
        queue.add("ns:data");
        assert!(sync.process_next().await);
        tokio::time::sleep(BASE + Duration::from_millis(1)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_from_reconcile_is_retried() {
        // e.g. the claim vanished between list and update
        let f = fixture_with(vec![Error::not_found("PersistentVolumeClaim", "ns/x")]);
        let sync = f.controller.storage_loop();
        let queue = sync.queue();
        f.storages.apply(storage("data"));

        assert!(sync.process_next().await);
        assert_eq!(queue.num_requeues("ns:data"), 1);
        assert_eq!(f.metrics.reconcile_count("Storage", ReconcileResult::Error), 1);
        assert_eq!(f.metrics.reconcile_count("Storage", ReconcileResult::NotFound), 0);

        tokio::time::sleep(BASE + Duration::from_millis(1)).await;
        assert_eq!(queue.len(), 1);
        assert!(sync.process_next().await);
        assert_eq!(f.storage_reconciler.calls(), 2);
        assert_eq!(queue.num_requeues("ns:data"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_object_clears_failure_count() {
        let f = fixture_with(vec![transient()]);
        let sync = f.controller.storage_loop();
        let queue = sync.queue();
        f.storages.apply(storage("data"));

        assert!(sync.process_next().await);
        assert_eq!(queue.num_requeues("ns:data"), 1);

        f.storages.remove("ns", "data");
        tokio::time::sleep(BASE + Duration::from_millis(1)).await;
        assert!(sync.process_next().await);

        assert_eq!(queue.num_requeues("ns:data"), 0);
        assert!(queue.is_empty());
        assert_eq!(
            f.metrics.reconcile_count("Storage", ReconcileResult::NotFound),
            1
        );
    }

    #[tokio::test]
    async fn test_panicking_reconcile_releases_key() {
        let storages = Arc::new(InMemoryCache::<Storage>::new("Storage"));
        let controller = Arc::new(
            Controller::builder()
                .storage_cache(storages.clone())
                .claim_cache(Arc::new(InMemoryCache::<PersistentVolumeClaim>::new(
                    "PersistentVolumeClaim",
                )))
                .storage_reconciler(Arc::new(Panicking))
                .claim_reconciler(Arc::new(ScriptedReconciler::default()))
                .storage_queue(RateLimitingQueue::with_backoff("storage", BASE, MAX))
                .claim_queue(RateLimitingQueue::with_backoff("claim", BASE, MAX))
                .initialize()
                .unwrap(),
        );
        storages.apply(storage("data"));

        let joined = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.storage_loop().process_next().await }).await
        };
        assert!(joined.is_err());

        let queue = controller.storage_loop().queue();
        queue.add("ns:data");
        assert_eq!(queue.len(), 1, "key must not stay in the processing set");
    }

    // =========================================================================
    // run
    // =========================================================================

    #[tokio::test]
    async fn test_run_rejects_zero_workers() {
        let f = fixture();
        let err = f.controller.run(0, CancellationToken::new()).await.unwrap_err();
        assert_matches!(err, Error::Config(_));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_never_starts_workers_on_unsynced_cache() {
        let storages = Arc::new(InMemoryCache::<Storage>::unsynced("Storage"));
        let storage_reconciler = Arc::new(ScriptedReconciler::default());
        let controller = Controller::builder()
            .storage_cache(storages.clone())
            .claim_cache(Arc::new(InMemoryCache::<PersistentVolumeClaim>::new(
                    "PersistentVolumeClaim",
                )))
            .storage_reconciler(storage_reconciler.clone())
            .claim_reconciler(Arc::new(ScriptedReconciler::default()))
            .storage_queue(RateLimitingQueue::with_backoff("storage", BASE, MAX))
            .claim_queue(RateLimitingQueue::with_backoff("claim", BASE, MAX))
            .initialize()
            .unwrap();
        storages.apply(storage("data"));

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            });
        }
        controller.run(2, cancel).await.unwrap();

        assert_eq!(storage_reconciler.calls(), 0);
        assert!(!controller.is_ready());
        assert!(controller.storage_loop().queue().is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_sync_predicate_gates_workers() {
        let storages = Arc::new(InMemoryCache::<Storage>::new("Storage"));
        let storage_reconciler = Arc::new(ScriptedReconciler::default());
        let attachments_synced = Arc::new(AtomicBool::new(false));
        let controller = Arc::new(
            Controller::builder()
                .storage_cache(storages.clone())
                .claim_cache(Arc::new(InMemoryCache::<PersistentVolumeClaim>::new(
                    "PersistentVolumeClaim",
                )))
                .storage_reconciler(storage_reconciler.clone())
                .claim_reconciler(Arc::new(ScriptedReconciler::default()))
                .storage_queue(RateLimitingQueue::with_backoff("storage", BASE, MAX))
                .claim_queue(RateLimitingQueue::with_backoff("claim", BASE, MAX))
                .wait_for({
                    let synced = attachments_synced.clone();
                    Arc::new(move || synced.load(Ordering::SeqCst))
                })
                .initialize()
                .unwrap(),
        );
        storages.apply(storage("data"));

        let cancel = CancellationToken::new();
        let run = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(1, cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(storage_reconciler.calls(), 0);
        assert!(!controller.is_ready());

        attachments_synced.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(controller.is_ready());
        assert_eq!(storage_reconciler.calls(), 1);

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert!(!controller.is_ready());
    }

    #[tokio::test]
    async fn test_run_processes_and_stops_on_cancel() {
        let f = fixture();
        let controller = Arc::new(f.controller);
        f.storages.apply(storage("a"));
        f.storages.apply(storage("b"));
        f.claims
            .apply(claim("ns-data-abcde", "Storage", "ddp.mayadata.io/v1alpha1"));

        let cancel = CancellationToken::new();
        let run = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(3, cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while f.storage_reconciler.calls() < 2 || f.claim_reconciler.calls() < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workers should drain the queues");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run should return after cancel")
            .unwrap()
            .unwrap();
        assert!(controller.storage_loop().queue().is_shutting_down());
        assert!(controller.claim_loop().queue().is_shutting_down());
    }
}
