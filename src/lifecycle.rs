use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::types::{GenerationItem, ImagePayload, ImageResult};

/// Opaque handle standing in for a large in-memory payload. Cheap to clone
/// and compare; only meaningful to the store that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransientHandle(u64);

impl TransientHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// The platform blob facility the lifecycle manager parks payloads in.
pub trait TransientStore: Send + Sync {
    fn create(&self, data: Bytes, mime_hint: &str) -> TransientHandle;
    fn release(&self, handle: &TransientHandle);
}

/// Default store: a counter plus a map. Doubles as the test double, since
/// `resolve`/`len` expose exactly what is still held.
#[derive(Debug, Default)]
pub struct InMemoryTransientStore {
    next: AtomicU64,
    blobs: Mutex<HashMap<u64, (Bytes, String)>>,
}

impl InMemoryTransientStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, handle: &TransientHandle) -> Option<Bytes> {
        self.lock_blobs().get(&handle.0).map(|(data, _)| data.clone())
    }

    pub fn mime_hint(&self, handle: &TransientHandle) -> Option<String> {
        self.lock_blobs().get(&handle.0).map(|(_, mime)| mime.clone())
    }

    pub fn len(&self) -> usize {
        self.lock_blobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, HashMap<u64, (Bytes, String)>> {
        self.blobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TransientStore for InMemoryTransientStore {
    fn create(&self, data: Bytes, mime_hint: &str) -> TransientHandle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.lock_blobs().insert(id, (data, mime_hint.to_string()));
        TransientHandle(id)
    }

    fn release(&self, handle: &TransientHandle) {
        self.lock_blobs().remove(&handle.0);
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Pruning kicks in once the item collection grows past this.
    pub cleanup_threshold: usize,
    /// Pruning trims the collection down to this many items.
    pub retain_target: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            cleanup_threshold: 30,
            retain_target: 20,
        }
    }
}

/// Converts settled inline payloads into transient references and bounds the
/// live item collection. Raw inline payloads must never be exposed to a
/// caller; interning runs before the scheduler publishes a success.
pub struct LifecycleManager {
    store: std::sync::Arc<dyn TransientStore>,
    config: LifecycleConfig,
}

impl LifecycleManager {
    pub fn new(store: std::sync::Arc<dyn TransientStore>, config: LifecycleConfig) -> Self {
        Self { store, config }
    }

    /// Replaces an `InlineData` payload with a `TransientRef`; every other
    /// payload passes through untouched.
    pub fn intern(&self, result: ImageResult) -> ImageResult {
        match result.payload {
            ImagePayload::InlineData { data, mime_hint } => {
                let handle = self.store.create(data, &mime_hint);
                ImageResult {
                    payload: ImagePayload::TransientRef(handle),
                    revised_prompt: result.revised_prompt,
                }
            }
            payload => ImageResult {
                payload,
                revised_prompt: result.revised_prompt,
            },
        }
    }

    /// Drops the oldest items past the cleanup threshold, releasing each
    /// transient reference exactly once. Returns the dropped ids so the
    /// caller can discard per-item bookkeeping.
    pub fn prune(&self, items: &mut Vec<GenerationItem>) -> Vec<u64> {
        if items.len() <= self.config.cleanup_threshold {
            return Vec::new();
        }
        let excess = items.len() - self.config.retain_target.min(items.len());
        let dropped: Vec<GenerationItem> = items.drain(..excess).collect();
        for item in &dropped {
            self.release_item(item);
        }
        tracing::debug!(dropped = dropped.len(), retained = items.len(), "pruned generation items");
        dropped.into_iter().map(|item| item.id).collect()
    }

    /// Empties the collection and releases every held transient reference.
    pub fn clear_all(&self, items: &mut Vec<GenerationItem>) {
        let cleared: Vec<GenerationItem> = items.drain(..).collect();
        for item in &cleared {
            self.release_item(item);
        }
        tracing::debug!(cleared = cleared.len(), "cleared generation items");
    }

    /// Releases the transient reference behind a result that never reached
    /// an item, e.g. one whose item was pruned while the call was in flight.
    pub fn release_result(&self, result: &ImageResult) {
        if let ImagePayload::TransientRef(handle) = &result.payload {
            self.store.release(handle);
        }
    }

    fn release_item(&self, item: &GenerationItem) {
        if let Some(result) = item.result.as_ref() {
            self.release_result(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::GenerationStatus;

    fn success_item(id: u64, result: ImageResult) -> GenerationItem {
        GenerationItem {
            id,
            status: GenerationStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    #[test]
    fn intern_replaces_inline_with_transient_ref() {
        let store = Arc::new(InMemoryTransientStore::new());
        let manager = LifecycleManager::new(store.clone(), LifecycleConfig::default());

        let interned = manager.intern(
            ImageResult::inline(Bytes::from_static(b"\x89PNG"), "image/png")
                .with_revised_prompt("a cat, redrawn"),
        );
        let ImagePayload::TransientRef(handle) = &interned.payload else {
            panic!("expected transient ref, got {:?}", interned.payload);
        };
        assert_eq!(store.resolve(handle), Some(Bytes::from_static(b"\x89PNG")));
        assert_eq!(store.mime_hint(handle), Some("image/png".to_string()));
        assert_eq!(interned.revised_prompt.as_deref(), Some("a cat, redrawn"));

        // Url payloads pass through untouched.
        let url = manager.intern(ImageResult::remote_url("https://img.example/cat.png"));
        assert_eq!(
            url.payload,
            ImagePayload::RemoteUrl("https://img.example/cat.png".to_string())
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn prune_trims_to_target_and_releases_once() {
        let store = Arc::new(InMemoryTransientStore::new());
        let manager = LifecycleManager::new(
            store.clone(),
            LifecycleConfig {
                cleanup_threshold: 6,
                retain_target: 4,
            },
        );

        let mut items: Vec<GenerationItem> = (0..8)
            .map(|id| {
                success_item(
                    id,
                    manager.intern(ImageResult::inline(Bytes::from(vec![id as u8]), "image/png")),
                )
            })
            .collect();
        assert_eq!(store.len(), 8);

        let dropped = manager.prune(&mut items);
        assert_eq!(dropped, vec![0, 1, 2, 3]);
        assert_eq!(items.len(), 4);
        assert_eq!(store.len(), 4);
        assert_eq!(items[0].id, 4);

        // Below the threshold nothing moves.
        assert!(manager.prune(&mut items).is_empty());
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn release_result_drops_the_backing_blob() {
        let store = Arc::new(InMemoryTransientStore::new());
        let manager = LifecycleManager::new(store.clone(), LifecycleConfig::default());

        let interned =
            manager.intern(ImageResult::inline(Bytes::from_static(b"a"), "image/png"));
        assert_eq!(store.len(), 1);
        manager.release_result(&interned);
        assert!(store.is_empty());

        // Non-transient payloads are a no-op.
        manager.release_result(&ImageResult::remote_url("https://img.example/1.png"));
    }

    #[test]
    fn clear_all_releases_everything() {
        let store = Arc::new(InMemoryTransientStore::new());
        let manager = LifecycleManager::new(store.clone(), LifecycleConfig::default());

        let mut items = vec![
            success_item(
                1,
                manager.intern(ImageResult::inline(Bytes::from_static(b"a"), "image/png")),
            ),
            success_item(2, ImageResult::remote_url("https://img.example/2.png")),
        ];
        manager.clear_all(&mut items);
        assert!(items.is_empty());
        assert!(store.is_empty());
    }
}
