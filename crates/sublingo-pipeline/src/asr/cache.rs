//! Bounded model-handle caches for local ASR runtimes.
//!
//! Loading whisper weights is expensive; handles are cached per model name
//! with small per-kind capacities. A single mutex guards all kinds.
//! Eviction drops the map entry only — a handle still held by an in-flight
//! transcription stays alive through its `Arc`.

use std::any::Any;
use std::sync::{Arc, Mutex};

/// Which runtime a handle belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelCacheKind {
    FasterWhisper,
    WhisperX,
    Diarization,
}

impl ModelCacheKind {
    /// Cache capacity for this kind.
    const fn capacity(self) -> usize {
        match self {
            Self::FasterWhisper | Self::Diarization => 2,
            Self::WhisperX => 1,
        }
    }
}

/// An opaque, shareable model handle.
pub type ModelHandle = Arc<dyn Any + Send + Sync>;

struct CacheSlot {
    kind: ModelCacheKind,
    key: String,
    handle: ModelHandle,
}

/// LRU handle cache, access-ordered (oldest first), one mutex for all kinds.
#[derive(Default)]
pub struct AsrModelCaches {
    slots: Mutex<Vec<CacheSlot>>,
}

impl AsrModelCaches {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a cached handle, refreshing its LRU position.
    pub fn get(&self, kind: ModelCacheKind, key: &str) -> Option<ModelHandle> {
        let mut slots = self.slots.lock().expect("model cache lock");
        let position = slots
            .iter()
            .position(|slot| slot.kind == kind && slot.key == key)?;
        let slot = slots.remove(position);
        let handle = Arc::clone(&slot.handle);
        slots.push(slot);
        Some(handle)
    }

    /// Insert a handle, evicting the least recently used of the same kind
    /// when over capacity.
    pub fn insert(&self, kind: ModelCacheKind, key: impl Into<String>, handle: ModelHandle) {
        let key = key.into();
        let mut slots = self.slots.lock().expect("model cache lock");
        slots.retain(|slot| !(slot.kind == kind && slot.key == key));
        slots.push(CacheSlot { kind, key, handle });

        let of_kind = slots.iter().filter(|slot| slot.kind == kind).count();
        if of_kind > kind.capacity() {
            let mut to_evict = of_kind - kind.capacity();
            slots.retain(|slot| {
                if slot.kind == kind && to_evict > 0 {
                    to_evict -= 1;
                    tracing::debug!(
                        target: "sublingo.asr",
                        key = %slot.key,
                        "evicting cached model handle"
                    );
                    false
                } else {
                    true
                }
            });
        }
    }

    #[cfg(test)]
    fn len(&self, kind: ModelCacheKind) -> usize {
        self.slots
            .lock()
            .expect("model cache lock")
            .iter()
            .filter(|slot| slot.kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(tag: &str) -> ModelHandle {
        Arc::new(tag.to_string())
    }

    #[test]
    fn get_refreshes_lru_order() {
        let caches = AsrModelCaches::new();
        caches.insert(ModelCacheKind::FasterWhisper, "small", handle("small"));
        caches.insert(ModelCacheKind::FasterWhisper, "base", handle("base"));
        // Refresh "small", then inserting a third should evict "base"
        assert!(caches.get(ModelCacheKind::FasterWhisper, "small").is_some());
        caches.insert(ModelCacheKind::FasterWhisper, "large-v3", handle("large"));

        assert!(caches.get(ModelCacheKind::FasterWhisper, "base").is_none());
        assert!(caches.get(ModelCacheKind::FasterWhisper, "small").is_some());
        assert!(caches.get(ModelCacheKind::FasterWhisper, "large-v3").is_some());
        assert_eq!(caches.len(ModelCacheKind::FasterWhisper), 2);
    }

    #[test]
    fn kinds_have_independent_capacities() {
        let caches = AsrModelCaches::new();
        caches.insert(ModelCacheKind::WhisperX, "large-v3", handle("a"));
        caches.insert(ModelCacheKind::WhisperX, "medium", handle("b"));
        assert_eq!(caches.len(ModelCacheKind::WhisperX), 1);
        assert!(caches.get(ModelCacheKind::WhisperX, "large-v3").is_none());

        caches.insert(ModelCacheKind::Diarization, "seg-a", handle("c"));
        caches.insert(ModelCacheKind::Diarization, "seg-b", handle("d"));
        assert_eq!(caches.len(ModelCacheKind::Diarization), 2);
    }

    #[test]
    fn evicted_handle_survives_while_held() {
        let caches = AsrModelCaches::new();
        caches.insert(ModelCacheKind::WhisperX, "large-v3", handle("kept"));
        let held = caches.get(ModelCacheKind::WhisperX, "large-v3").unwrap();
        caches.insert(ModelCacheKind::WhisperX, "other", handle("new"));

        // The entry is gone from the cache, the handle is still usable
        assert!(caches.get(ModelCacheKind::WhisperX, "large-v3").is_none());
        assert_eq!(held.downcast_ref::<String>().unwrap(), "kept");
    }

    #[test]
    fn reinserting_same_key_does_not_grow() {
        let caches = AsrModelCaches::new();
        caches.insert(ModelCacheKind::FasterWhisper, "small", handle("a"));
        caches.insert(ModelCacheKind::FasterWhisper, "small", handle("b"));
        assert_eq!(caches.len(ModelCacheKind::FasterWhisper), 1);
    }
}
