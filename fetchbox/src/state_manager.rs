//! The process-wide cache and subscription registry.
//!
//! The [`StateManager`] owns three maps:
//!
//! - **entries** - keyed [`CacheEntry`]s, the durable (process-lifetime)
//!   record of every operation's last known state
//! - **subscribers** - per-key parameterless callbacks fired synchronously
//!   whenever that key's entry changes
//! - **pending** - in-flight response futures, used exclusively for request
//!   deduplication
//!
//! An entry exists iff something seeded it (a commit, a pre-seed,
//! `set_meta`); subscribing alone never creates one. Tag invalidation via
//! [`mark_stale`](StateManager::mark_stale) only flips the `stale` flag -
//! the data stays visible, no subscriber fires, and the separately emitted
//! `refetch` event drives the actual re-read. That separation lets
//! UI-independent code invalidate without side effects.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use smol_str::SmolStr;
use tracing::debug;

use fetchbox_core::{CacheEntry, CachePatch, MetaMap, QueryKey, Response};

use crate::events::Subscription;

/// An in-flight response future, cloneable by every deduplicated caller.
pub type SharedResponse = Shared<BoxFuture<'static, Response>>;

type Subscriber = Arc<dyn Fn() + Send + Sync>;
type DataObserver = Arc<dyn Fn(&QueryKey, Option<&Value>) + Send + Sync>;

/// Keyed cache, per-key subscribers, and the in-flight future registry.
#[derive(Default)]
pub struct StateManager {
    entries: DashMap<QueryKey, CacheEntry>,
    subscribers: DashMap<QueryKey, Vec<(u64, Subscriber)>>,
    pending: DashMap<QueryKey, SharedResponse>,
    data_observers: DashMap<u64, DataObserver>,
    next_id: AtomicU64,
}

impl StateManager {
    /// Creates an empty state manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the canonical key for a request. Pure; no side effects.
    pub fn create_query_key(
        path: &str,
        method: fetchbox_core::Method,
        options: &fetchbox_core::RequestOptions,
    ) -> QueryKey {
        QueryKey::for_request(path, method, options)
    }

    /// Returns the entry for a key, if one has been seeded.
    pub fn get_cache(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Applies a partial update to a key's entry, creating the entry with
    /// defaults if absent.
    ///
    /// State merges shallowly; `tags` replaces the list when given;
    /// `previous_data` and `stale` are set only when the patch carries
    /// them. Subscribers of the key are always notified. A data-change
    /// event fires when `state.data` actually changed.
    pub fn set_cache(&self, key: &QueryKey, patch: CachePatch) {
        let data_changed;
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.self_tag()));

            let mut changed_data = false;
            if let Some(state) = patch.state {
                changed_data = state.data.apply(&mut entry.state.data);
                state.error.apply(&mut entry.state.error);
                if let Some(timestamp) = state.timestamp {
                    entry.state.timestamp = timestamp;
                }
            }
            if let Some(tags) = patch.tags {
                entry.tags = tags;
            }
            match patch.previous_data {
                fetchbox_core::PatchOp::Keep => {}
                fetchbox_core::PatchOp::Set(snapshot) => entry.previous_data = Some(snapshot),
                fetchbox_core::PatchOp::Clear => entry.previous_data = None,
            }
            if let Some(stale) = patch.stale {
                entry.stale = stale;
            }
            data_changed = changed_data;
        }
        // Entry guard dropped: subscribers may re-enter the manager.
        self.notify(key);
        if data_changed {
            let data = self.entries.get(key).and_then(|entry| entry.state.data.clone());
            self.notify_data_change(key, data.as_ref());
        }
    }

    /// Removes a key's entry. The subscriber set is untouched.
    pub fn delete_cache(&self, key: &QueryKey) {
        self.entries.remove(key);
    }

    /// Registers a callback fired whenever the key's entry changes.
    ///
    /// Never creates a cache entry.
    pub fn subscribe_cache(
        self: &Arc<Self>,
        key: &QueryKey,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(callback)));

        let manager = Arc::downgrade(self);
        let key = key.clone();
        Subscription::new(move || {
            if let Some(manager) = manager.upgrade()
                && let Some(mut subscribers) = manager.subscribers.get_mut(&key)
            {
                subscribers.retain(|(subscriber_id, _)| *subscriber_id != id);
            }
        })
    }

    /// Returns the first entry whose tags intersect `tags` and whose
    /// `state.data` is defined.
    pub fn get_cache_by_tags(&self, tags: &[SmolStr]) -> Option<CacheEntry> {
        self.entries
            .iter()
            .find(|entry| entry.has_any_tag(tags) && entry.state.data.is_some())
            .map(|entry| entry.clone())
    }

    /// Returns every entry whose tags intersect `tags`, with its key.
    pub fn get_cache_entries_by_tags(&self, tags: &[SmolStr]) -> Vec<(QueryKey, CacheEntry)> {
        self.entries
            .iter()
            .filter(|entry| entry.has_any_tag(tags))
            .map(|entry| (entry.key().clone(), entry.clone()))
            .collect()
    }

    /// Returns every entry with the given self-tag, with its key.
    pub fn get_cache_entries_by_self_tag(&self, self_tag: &str) -> Vec<(QueryKey, CacheEntry)> {
        self.entries
            .iter()
            .filter(|entry| entry.self_tag.as_deref() == Some(self_tag))
            .map(|entry| (entry.key().clone(), entry.clone()))
            .collect()
    }

    /// Merges a patch into a key's `meta`, upserting the entry, and
    /// notifies subscribers.
    pub fn set_meta(&self, key: &QueryKey, patch: MetaMap) {
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(key.self_tag()));
            entry.meta.extend(patch);
        }
        self.notify(key);
    }

    /// Flags every entry whose tags intersect `tags` as stale.
    ///
    /// Never notifies subscribers: data stays visible and the caller's
    /// `refetch` emission drives the re-read.
    pub fn mark_stale(&self, tags: &[SmolStr]) {
        if tags.is_empty() {
            return;
        }
        let mut flagged = 0usize;
        for mut entry in self.entries.iter_mut() {
            if entry.has_any_tag(tags) {
                entry.stale = true;
                flagged += 1;
            }
        }
        debug!(?tags, flagged, "marked stale");
    }

    /// Registers an in-flight future for a key, or clears it with `None`.
    pub fn set_pending(&self, key: &QueryKey, future: Option<SharedResponse>) {
        match future {
            Some(future) => {
                self.pending.insert(key.clone(), future);
            }
            None => {
                self.pending.remove(key);
            }
        }
    }

    /// Returns the in-flight future for a key, if any.
    pub fn get_pending(&self, key: &QueryKey) -> Option<SharedResponse> {
        self.pending.get(key).map(|future| future.clone())
    }

    /// Atomically registers `future` for the key unless one is already in
    /// flight.
    ///
    /// Returns the future to await and whether this caller registered it
    /// (`false` means an earlier caller's flight was joined). The
    /// insert-if-absent keeps concurrent same-key executions down to a
    /// single transport dispatch.
    pub fn register_pending(
        &self,
        key: &QueryKey,
        future: SharedResponse,
    ) -> (SharedResponse, bool) {
        match self.pending.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (entry.get().clone(), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(future.clone());
                (future, true)
            }
        }
    }

    /// Registers an observer fired whenever any key's `state.data` changes.
    ///
    /// Used by devtools and persistence extensions.
    pub fn on_data_change(
        self: &Arc<Self>,
        observer: impl Fn(&QueryKey, Option<&Value>) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.data_observers.insert(id, Arc::new(observer));

        let manager = Arc::downgrade(self);
        Subscription::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.data_observers.remove(&id);
            }
        })
    }

    /// Returns a snapshot of every entry, for external persistence adapters.
    pub fn get_all_cache_entries(&self) -> Vec<(QueryKey, CacheEntry)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.clone()))
            .collect()
    }

    /// Wipes everything: entries, subscribers, pending futures, observers.
    pub fn clear(&self) {
        self.entries.clear();
        self.subscribers.clear();
        self.pending.clear();
        self.data_observers.clear();
    }

    fn notify(&self, key: &QueryKey) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .get(key)
            .map(|entry| entry.iter().map(|(_, subscriber)| Arc::clone(subscriber)).collect())
            .unwrap_or_default();
        for subscriber in subscribers {
            subscriber();
        }
    }

    fn notify_data_change(&self, key: &QueryKey, data: Option<&Value>) {
        let observers: Vec<DataObserver> = self
            .data_observers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for observer in observers {
            observer(key, data);
        }
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("entries", &self.entries.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetchbox_core::{Method, PatchOp, RequestOptions, StatePatch};
    use futures::FutureExt;
    use serde_json::json;
    use std::sync::Mutex;

    fn key(path: &str) -> QueryKey {
        QueryKey::for_request(path, Method::Get, &RequestOptions::new())
    }

    #[test]
    fn test_set_cache_commits_and_notifies_once() {
        let manager = Arc::new(StateManager::new());
        let k = key("/posts");
        let fired: Arc<Mutex<u32>> = Arc::default();
        let sink = Arc::clone(&fired);
        let _subscription = manager.subscribe_cache(&k, move || {
            *sink.lock().expect("lock") += 1;
        });

        manager.set_cache(&k, CachePatch::commit(json!({"id": 1}), 7));

        let entry = manager.get_cache(&k).expect("entry seeded");
        assert_eq!(entry.state.data, Some(json!({"id": 1})));
        assert_eq!(entry.state.timestamp, 7);
        assert!(!entry.stale);
        assert_eq!(*fired.lock().expect("lock"), 1);
    }

    #[test]
    fn test_subscribe_does_not_create_entry() {
        let manager = Arc::new(StateManager::new());
        let k = key("/posts");
        let _subscription = manager.subscribe_cache(&k, || {});
        assert!(manager.get_cache(&k).is_none());
    }

    #[test]
    fn test_unsubscribed_callback_never_fires() {
        let manager = Arc::new(StateManager::new());
        let k = key("/posts");
        let fired: Arc<Mutex<u32>> = Arc::default();
        let sink = Arc::clone(&fired);
        let subscription = manager.subscribe_cache(&k, move || {
            *sink.lock().expect("lock") += 1;
        });
        subscription.unsubscribe();

        manager.set_cache(&k, CachePatch::commit(json!(1), 1));
        assert_eq!(*fired.lock().expect("lock"), 0);
    }

    #[test]
    fn test_pending_registry_roundtrip() {
        let manager = StateManager::new();
        let k = key("/posts");
        let future: SharedResponse = async { Response::ok(json!(1)) }.boxed().shared();

        manager.set_pending(&k, Some(future.clone()));
        assert!(manager.get_pending(&k).is_some());

        manager.set_pending(&k, None);
        assert!(manager.get_pending(&k).is_none());
    }

    #[test]
    fn test_mark_stale_flags_without_touching_data() {
        let manager = Arc::new(StateManager::new());
        let k = key("/posts");
        let other = key("/users");
        manager.set_cache(
            &k,
            CachePatch::commit(json!([1, 2]), 1).tags(vec![SmolStr::new("posts")]),
        );
        manager.set_cache(
            &other,
            CachePatch::commit(json!("u"), 1).tags(vec![SmolStr::new("users")]),
        );

        let fired: Arc<Mutex<u32>> = Arc::default();
        let sink = Arc::clone(&fired);
        let _subscription = manager.subscribe_cache(&k, move || {
            *sink.lock().expect("lock") += 1;
        });

        manager.mark_stale(&[SmolStr::new("posts")]);

        let entry = manager.get_cache(&k).expect("entry");
        assert!(entry.stale);
        assert_eq!(entry.state.data, Some(json!([1, 2])));
        assert!(!manager.get_cache(&other).expect("entry").stale);
        assert_eq!(*fired.lock().expect("lock"), 0, "mark_stale must not notify");
    }

    #[test]
    fn test_get_cache_by_tags_requires_data() {
        let manager = StateManager::new();
        let empty = key("/empty");
        manager.set_cache(
            &empty,
            CachePatch::default().tags(vec![SmolStr::new("posts")]),
        );
        assert!(manager.get_cache_by_tags(&[SmolStr::new("posts")]).is_none());

        let full = key("/full");
        manager.set_cache(
            &full,
            CachePatch::commit(json!(1), 1).tags(vec![SmolStr::new("posts")]),
        );
        assert!(manager.get_cache_by_tags(&[SmolStr::new("posts")]).is_some());
    }

    #[test]
    fn test_set_meta_upserts_without_disturbing_state() {
        let manager = StateManager::new();
        let k = key("/posts");
        manager.set_meta(&k, MetaMap::from([(SmolStr::new("isOptimistic"), json!(true))]));

        let entry = manager.get_cache(&k).expect("upserted");
        assert_eq!(entry.meta.get("isOptimistic"), Some(&json!(true)));
        assert_eq!(entry.state, Default::default());
        assert_eq!(entry.self_tag.as_deref(), Some("/posts"));
    }

    #[test]
    fn test_previous_data_set_and_clear() {
        let manager = StateManager::new();
        let k = key("/posts");
        manager.set_cache(
            &k,
            CachePatch {
                state: Some(StatePatch::data(json!([2]))),
                previous_data: PatchOp::Set(Some(json!([1, 2]))),
                ..Default::default()
            },
        );
        let entry = manager.get_cache(&k).expect("entry");
        assert!(entry.is_optimistic());
        assert_eq!(entry.previous_data, Some(Some(json!([1, 2]))));

        manager.set_cache(
            &k,
            CachePatch {
                previous_data: PatchOp::Clear,
                ..Default::default()
            },
        );
        assert!(!manager.get_cache(&k).expect("entry").is_optimistic());
    }

    #[test]
    fn test_data_change_observer() {
        let manager = Arc::new(StateManager::new());
        let k = key("/posts");
        let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let _subscription = manager.on_data_change(move |_, data| {
            sink.lock().expect("lock").push(data.cloned());
        });

        manager.set_cache(&k, CachePatch::commit(json!(1), 1));
        // Same data again: no reference change, no event.
        manager.set_cache(&k, CachePatch::state(StatePatch::data(json!(1))));
        manager.set_cache(&k, CachePatch::state(StatePatch::data(json!(2))));

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.as_slice(), [Some(json!(1)), Some(json!(2))]);
    }

    #[test]
    fn test_clear_wipes_everything() {
        let manager = Arc::new(StateManager::new());
        let k = key("/posts");
        manager.set_cache(&k, CachePatch::commit(json!(1), 1));
        let future: SharedResponse = async { Response::ok(json!(1)) }.boxed().shared();
        manager.set_pending(&k, Some(future));

        manager.clear();
        assert!(manager.get_cache(&k).is_none());
        assert!(manager.get_pending(&k).is_none());
        assert!(manager.get_all_cache_entries().is_empty());
    }
}
