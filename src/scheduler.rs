use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Semaphore, watch};
use tracing::{debug, warn};

use crate::adapter::ImageAdapter;
use crate::capability::{CapabilityProfile, builtin_profiles};
use crate::lifecycle::{InMemoryTransientStore, LifecycleConfig, LifecycleManager, TransientStore};
use crate::types::{GenerationItem, GenerationRequest, GenerationStatus, ImageResult};
use crate::{EaselError, Result};

/// Default bound on concurrent outstanding provider calls.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_in_flight: usize,
    pub lifecycle: LifecycleConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            lifecycle: LifecycleConfig::default(),
        }
    }
}

pub struct SchedulerBuilder {
    adapters: HashMap<String, Arc<dyn ImageAdapter>>,
    profiles: HashMap<String, CapabilityProfile>,
    store: Option<Arc<dyn TransientStore>>,
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            profiles: builtin_profiles(),
            store: None,
            config: SchedulerConfig::default(),
        }
    }

    pub fn adapter(mut self, provider_id: impl Into<String>, adapter: Arc<dyn ImageAdapter>) -> Self {
        self.adapters.insert(provider_id.into(), adapter);
        self
    }

    /// Adds or overrides a capability profile on top of the built-in table.
    pub fn profile(mut self, provider_id: impl Into<String>, profile: CapabilityProfile) -> Self {
        self.profiles.insert(provider_id.into(), profile);
        self
    }

    pub fn transient_store(mut self, store: Arc<dyn TransientStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.config.max_in_flight = max_in_flight;
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.config.lifecycle = lifecycle;
        self
    }

    pub fn build(self) -> GenerationScheduler {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTransientStore::new()));
        let (items_tx, _) = watch::channel(Vec::new());
        GenerationScheduler {
            inner: Arc::new(Inner {
                adapters: self.adapters,
                profiles: self.profiles,
                limiter: Arc::new(Semaphore::new(self.config.max_in_flight.max(1))),
                cancel_epoch: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                lifecycle: LifecycleManager::new(store, self.config.lifecycle),
                items_tx,
                contexts: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct Inner {
    adapters: HashMap<String, Arc<dyn ImageAdapter>>,
    profiles: HashMap<String, CapabilityProfile>,
    limiter: Arc<Semaphore>,
    cancel_epoch: AtomicU64,
    next_id: AtomicU64,
    lifecycle: LifecycleManager,
    items_tx: watch::Sender<Vec<GenerationItem>>,
    contexts: Mutex<HashMap<u64, GenerationRequest>>,
}

/// Orchestrates fan-out against provider adapters: decides batched vs
/// per-item dispatch, bounds concurrency, owns the shared cancellation
/// signal, and publishes every item mutation as a whole-collection snapshot
/// so observers always see consistent state.
#[derive(Clone)]
pub struct GenerationScheduler {
    inner: Arc<Inner>,
}

impl GenerationScheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// Validates the request and returns the freshly allocated `Pending`
    /// items immediately; they settle asynchronously. Must be called within
    /// a tokio runtime.
    pub fn schedule(&self, request: GenerationRequest) -> Result<Vec<GenerationItem>> {
        let profile = self
            .inner
            .profiles
            .get(&request.provider_id)
            .cloned()
            .ok_or_else(|| EaselError::UnknownProvider(request.provider_id.clone()))?;
        let adapter = self
            .inner
            .adapters
            .get(&request.provider_id)
            .cloned()
            .ok_or_else(|| EaselError::UnknownProvider(request.provider_id.clone()))?;
        profile.validate(&request)?;

        // Each batch carries the epoch current at schedule time; only a
        // later `cancel` call can skip its undispatched calls.
        let epoch = self.inner.cancel_epoch.load(Ordering::SeqCst);

        let count = request.count as usize;
        let ids: Vec<u64> = (0..count)
            .map(|_| self.inner.next_id.fetch_add(1, Ordering::SeqCst))
            .collect();
        let new_items: Vec<GenerationItem> =
            ids.iter().map(|&id| GenerationItem::pending(id)).collect();

        {
            let mut contexts = self.lock_contexts();
            for &id in &ids {
                contexts.insert(id, request.clone());
            }
        }
        let snapshot = new_items.clone();
        self.mutate(move |items| items.extend(new_items));

        let batched = profile.max_batch_size > 1 && request.count > 1;
        debug!(
            provider = %request.provider_id,
            count,
            batched,
            "accepted generation request"
        );

        if batched {
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler
                    .run_batched(adapter, profile, request, ids, epoch)
                    .await;
            });
        } else {
            for &id in &ids {
                let scheduler = self.clone();
                let adapter = adapter.clone();
                let profile = profile.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    scheduler
                        .run_single(adapter, profile, request, id, Some(epoch))
                        .await;
                });
            }
        }

        Ok(snapshot)
    }

    /// Re-runs the single-item path for exactly this id, resetting it to
    /// `Loading` and clearing the previous error. Only failed or cancelled
    /// items may be retried; the rest of the collection is untouched.
    pub fn retry(&self, id: u64) -> Result<()> {
        let status = self
            .inner
            .items_tx
            .borrow()
            .iter()
            .find(|item| item.id == id)
            .map(|item| item.status);
        match status {
            Some(GenerationStatus::Error | GenerationStatus::Cancelled) => {}
            Some(other) => {
                return Err(EaselError::Validation(format!(
                    "item {id} is {other:?}, only failed or cancelled items can be retried"
                )));
            }
            None => {
                return Err(EaselError::Validation(format!("unknown item id {id}")));
            }
        }
        let request = self
            .lock_contexts()
            .get(&id)
            .cloned()
            .ok_or_else(|| EaselError::Validation(format!("unknown item id {id}")))?;
        let profile = self
            .inner
            .profiles
            .get(&request.provider_id)
            .cloned()
            .ok_or_else(|| EaselError::UnknownProvider(request.provider_id.clone()))?;
        let adapter = self
            .inner
            .adapters
            .get(&request.provider_id)
            .cloned()
            .ok_or_else(|| EaselError::UnknownProvider(request.provider_id.clone()))?;

        debug!(id, provider = %request.provider_id, "retrying item");
        self.mutate(move |items| {
            if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                item.status = GenerationStatus::Loading;
                item.error = None;
                item.result = None;
            }
        });

        let scheduler = self.clone();
        tokio::spawn(async move {
            // Retry is an explicit caller action: it runs outside any
            // cancellation scope.
            scheduler
                .run_single(adapter, profile, request, id, None)
                .await;
        });
        Ok(())
    }

    /// Cancels, cooperatively, every batch scheduled so far: their calls not
    /// yet dispatched are skipped and those items end `Cancelled`, while
    /// calls already in flight settle normally and keep their results.
    /// Batches scheduled after this call are unaffected.
    pub fn cancel(&self) {
        self.inner.cancel_epoch.fetch_add(1, Ordering::SeqCst);
        debug!("cancellation requested");
    }

    /// Empties the item collection, releasing every held transient
    /// reference.
    pub fn clear_all(&self) {
        self.inner
            .items_tx
            .send_modify(|items| self.inner.lifecycle.clear_all(items));
        self.lock_contexts().clear();
    }

    /// Current snapshot of the item collection.
    pub fn items(&self) -> Vec<GenerationItem> {
        self.inner.items_tx.borrow().clone()
    }

    /// Observe item-state changes; every mutation publishes a new snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Vec<GenerationItem>> {
        self.inner.items_tx.subscribe()
    }

    /// Resolves once no item is `Pending` or `Loading`.
    pub async fn wait_settled(&self) {
        let mut rx = self.subscribe();
        loop {
            if rx
                .borrow_and_update()
                .iter()
                .all(|item| item.status.is_terminal())
            {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn run_single(
        &self,
        adapter: Arc<dyn ImageAdapter>,
        profile: CapabilityProfile,
        request: GenerationRequest,
        id: u64,
        cancel_scope: Option<u64>,
    ) {
        let _permit = match self.inner.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if let Some(epoch) = cancel_scope {
            if self.inner.cancel_epoch.load(Ordering::SeqCst) != epoch {
                debug!(id, "skipping undispatched call, batch cancelled");
                self.transition(id, GenerationStatus::Cancelled);
                return;
            }
        }
        if !self.item_exists(id) {
            debug!(id, "item no longer tracked, skipping dispatch");
            return;
        }
        self.transition(id, GenerationStatus::Loading);
        debug!(id, provider = %request.provider_id, "dispatching image call");

        match adapter.invoke(&request, &profile, 1).await {
            Ok(mut results) if !results.is_empty() => {
                let result = self.inner.lifecycle.intern(results.remove(0));
                self.settle_success(id, result);
            }
            Ok(_) => {
                self.settle_error(id, "provider returned no image for this slot".to_string());
            }
            Err(err) => {
                warn!(id, provider = %request.provider_id, error = %err, "image call failed");
                self.settle_error(id, err.to_string());
            }
        }
    }

    async fn run_batched(
        &self,
        adapter: Arc<dyn ImageAdapter>,
        profile: CapabilityProfile,
        request: GenerationRequest,
        ids: Vec<u64>,
        epoch: u64,
    ) {
        let _permit = match self.inner.limiter.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if self.inner.cancel_epoch.load(Ordering::SeqCst) != epoch {
            debug!(count = ids.len(), "skipping undispatched batch, cancelled");
            for &id in &ids {
                self.transition(id, GenerationStatus::Cancelled);
            }
            return;
        }
        // Items pruned while this batch waited on the limiter get no call.
        let ids: Vec<u64> = {
            let items = self.inner.items_tx.borrow();
            ids.into_iter()
                .filter(|id| items.iter().any(|item| item.id == *id))
                .collect()
        };
        if ids.is_empty() {
            debug!("batch fully pruned before dispatch, skipping call");
            return;
        }
        {
            let ids = ids.clone();
            self.mutate(move |items| {
                for &id in &ids {
                    if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                        if item.status == GenerationStatus::Pending {
                            item.status = GenerationStatus::Loading;
                        }
                    }
                }
            });
        }
        debug!(
            provider = %request.provider_id,
            count = ids.len(),
            "dispatching batched image call"
        );

        match adapter.invoke(&request, &profile, ids.len() as u32).await {
            Ok(results) => {
                let requested = ids.len();
                let returned = results.len();
                if returned < requested {
                    warn!(requested, returned, "batched call returned fewer images than requested");
                }
                // Intern only what maps to a slot; surplus results never get
                // a transient handle, so nothing leaks when they are
                // dropped.
                let interned: Vec<ImageResult> = results
                    .into_iter()
                    .take(requested)
                    .map(|result| self.inner.lifecycle.intern(result))
                    .collect();
                let mut applied = vec![false; interned.len()];
                self.mutate(|items| {
                    for (slot, &id) in ids.iter().enumerate() {
                        let Some(item) = items.iter_mut().find(|item| item.id == id) else {
                            continue;
                        };
                        if item.status != GenerationStatus::Loading {
                            continue;
                        }
                        match interned.get(slot) {
                            Some(result) => {
                                item.status = GenerationStatus::Success;
                                item.result = Some(result.clone());
                                item.error = None;
                                applied[slot] = true;
                            }
                            None => {
                                item.status = GenerationStatus::Error;
                                item.error = Some(format!(
                                    "provider returned {returned} of {requested} requested images"
                                ));
                            }
                        }
                    }
                });
                for (slot, result) in interned.iter().enumerate() {
                    if !applied[slot] {
                        warn!(slot, "item gone before settlement, releasing its image");
                        self.inner.lifecycle.release_result(result);
                    }
                }
            }
            Err(err) => {
                warn!(provider = %request.provider_id, error = %err, "batched image call failed");
                let message = err.to_string();
                self.mutate(move |items| {
                    for &id in &ids {
                        if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                            if item.status == GenerationStatus::Loading {
                                item.status = GenerationStatus::Error;
                                item.error = Some(message.clone());
                            }
                        }
                    }
                });
            }
        }
    }

    fn settle_success(&self, id: u64, result: ImageResult) {
        let mut result = Some(result);
        self.mutate(|items| {
            if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                if item.status == GenerationStatus::Loading {
                    item.status = GenerationStatus::Success;
                    item.result = result.take();
                    item.error = None;
                }
            }
        });
        // The item may have been pruned while the call was in flight; its
        // interned reference must still be released exactly once.
        if let Some(orphan) = result {
            warn!(id, "item gone before settlement, releasing its image");
            self.inner.lifecycle.release_result(&orphan);
        }
    }

    fn settle_error(&self, id: u64, message: String) {
        self.mutate(move |items| {
            if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                if item.status == GenerationStatus::Loading {
                    item.status = GenerationStatus::Error;
                    item.error = Some(message);
                    item.result = None;
                }
            }
        });
    }

    fn item_exists(&self, id: u64) -> bool {
        self.inner.items_tx.borrow().iter().any(|item| item.id == id)
    }

    fn transition(&self, id: u64, status: GenerationStatus) {
        self.mutate(move |items| {
            if let Some(item) = items.iter_mut().find(|item| item.id == id) {
                let allowed = match status {
                    GenerationStatus::Cancelled => item.status == GenerationStatus::Pending,
                    GenerationStatus::Loading => item.status == GenerationStatus::Pending,
                    _ => false,
                };
                if allowed {
                    item.status = status;
                }
            }
        });
    }

    /// All item mutations funnel through here: apply the change, prune past
    /// the retention threshold, publish one consistent snapshot, and drop
    /// bookkeeping for pruned ids.
    fn mutate(&self, apply: impl FnOnce(&mut Vec<GenerationItem>)) {
        let mut dropped = Vec::new();
        self.inner.items_tx.send_modify(|items| {
            apply(items);
            dropped = self.inner.lifecycle.prune(items);
        });
        if !dropped.is_empty() {
            let mut contexts = self.lock_contexts();
            for id in dropped {
                contexts.remove(&id);
            }
        }
    }

    fn lock_contexts(&self) -> MutexGuard<'_, HashMap<u64, GenerationRequest>> {
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
