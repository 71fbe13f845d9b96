//! Operation state and cache entry types.
//!
//! This module provides the shapes held by the state manager:
//!
//! - [`OperationState`] - the user-visible result of an operation for one key
//! - [`CacheEntry`] - state plus the machinery around it (tags, meta,
//!   staleness, optimistic snapshot)
//! - [`CachePatch`] / [`StatePatch`] - partial updates with explicit
//!   keep/set/clear semantics
//!
//! ## State vs. entry
//!
//! `state` is deliberately just `{data, error, timestamp}`. Staleness lives
//! on the entry (`stale`), plugin annotations live in `meta`, and the
//! optimistic snapshot lives in `previous_data`. Keeping those out of
//! `state` keeps plugin bookkeeping from leaking into equality-based
//! subscription diffs, and marking an entry stale never touches the data a
//! reader is currently rendering.

use std::collections::HashMap;

use serde_json::Value;
use smol_str::SmolStr;

/// Plugin-contributed annotations on a cache entry.
pub type MetaMap = HashMap<SmolStr, Value>;

/// The user-visible result of an operation for one key.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OperationState {
    /// Last committed data, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Last observed error, if any. Never overwrites `data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Wall-clock milliseconds of the last successful commit; `0` if never
    /// committed. Monotonically increasing per key.
    pub timestamp: i64,
}

/// One keyed entry of the cache.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheEntry {
    /// The operation state for this key.
    pub state: OperationState,
    /// Tags classifying this entry for bulk invalidation.
    pub tags: Vec<SmolStr>,
    /// Plugin-contributed annotations (e.g. `isOptimistic`, `isInitialData`).
    pub meta: MetaMap,
    /// The tag equal to the canonical path, used for exact-target lookups.
    pub self_tag: Option<SmolStr>,
    /// Snapshot captured while an optimistic update is in flight.
    ///
    /// `Some(snapshot)` means an optimistic write is pending; the inner
    /// value is whatever `state.data` held before the provisional write
    /// (possibly nothing). Cleared on confirm or rollback.
    pub previous_data: Option<Option<Value>>,
    /// Hint-to-refetch flag set by tag invalidation. Data stays visible.
    pub stale: bool,
}

impl CacheEntry {
    /// Creates an empty entry with the given self-tag.
    pub fn new(self_tag: Option<SmolStr>) -> Self {
        CacheEntry {
            self_tag,
            ..Default::default()
        }
    }

    /// Whether an optimistic update is currently in flight for this entry.
    pub fn is_optimistic(&self) -> bool {
        self.previous_data.is_some()
    }

    /// Whether any of `tags` intersects this entry's tags.
    pub fn has_any_tag(&self, tags: &[SmolStr]) -> bool {
        self.tags.iter().any(|tag| tags.contains(tag))
    }
}

/// A field update with explicit keep/set/clear semantics.
///
/// Partial updates in the data layer distinguish "leave the field alone"
/// from "clear it", the way optional properties do in a dynamic language.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum PatchOp<T> {
    /// Leave the field untouched.
    #[default]
    Keep,
    /// Replace the field with this value.
    Set(T),
    /// Clear the field.
    Clear,
}

impl<T> PatchOp<T> {
    /// Applies this op to a field, returning whether it changed anything.
    pub fn apply(self, field: &mut Option<T>) -> bool
    where
        T: PartialEq,
    {
        match self {
            PatchOp::Keep => false,
            PatchOp::Set(value) => {
                let changed = field.as_ref() != Some(&value);
                *field = Some(value);
                changed
            }
            PatchOp::Clear => {
                let changed = field.is_some();
                *field = None;
                changed
            }
        }
    }
}

/// A shallow partial update of [`OperationState`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatePatch {
    /// Update for `state.data`.
    pub data: PatchOp<Value>,
    /// Update for `state.error`.
    pub error: PatchOp<Value>,
    /// New commit timestamp, when given.
    pub timestamp: Option<i64>,
}

impl StatePatch {
    /// A patch setting only `data`.
    pub fn data(value: Value) -> Self {
        StatePatch {
            data: PatchOp::Set(value),
            ..Default::default()
        }
    }

    /// A patch setting only `error`.
    pub fn error(value: Value) -> Self {
        StatePatch {
            error: PatchOp::Set(value),
            ..Default::default()
        }
    }

    /// The commit patch: data set, error cleared, timestamp updated.
    pub fn commit(data: Value, timestamp: i64) -> Self {
        StatePatch {
            data: PatchOp::Set(data),
            error: PatchOp::Clear,
            timestamp: Some(timestamp),
        }
    }
}

/// A partial update of a [`CacheEntry`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CachePatch {
    /// Shallow merge into `state`.
    pub state: Option<StatePatch>,
    /// Replacement tag list, when given.
    pub tags: Option<Vec<SmolStr>>,
    /// Update for the optimistic snapshot. The inner `Option<Value>` is the
    /// snapshot itself; `Set(None)` records "snapshot of an absent value".
    pub previous_data: PatchOp<Option<Value>>,
    /// New staleness flag, when given.
    pub stale: Option<bool>,
}

impl CachePatch {
    /// A patch merging only a state update.
    pub fn state(patch: StatePatch) -> Self {
        CachePatch {
            state: Some(patch),
            ..Default::default()
        }
    }

    /// The commit patch used by controllers and the cache plugin: state
    /// committed, entry marked fresh.
    pub fn commit(data: Value, timestamp: i64) -> Self {
        CachePatch {
            state: Some(StatePatch::commit(data, timestamp)),
            stale: Some(false),
            ..Default::default()
        }
    }

    /// Sets the replacement tag list.
    pub fn tags(mut self, tags: Vec<SmolStr>) -> Self {
        self.tags = Some(tags);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_op_keep_set_clear() {
        let mut field = Some(json!(1));
        assert!(!PatchOp::<Value>::Keep.apply(&mut field));
        assert_eq!(field, Some(json!(1)));

        assert!(PatchOp::Set(json!(2)).apply(&mut field));
        assert_eq!(field, Some(json!(2)));

        assert!(!PatchOp::Set(json!(2)).apply(&mut field));

        assert!(PatchOp::<Value>::Clear.apply(&mut field));
        assert_eq!(field, None);
        assert!(!PatchOp::<Value>::Clear.apply(&mut field));
    }

    #[test]
    fn test_commit_patch_clears_error() {
        let patch = StatePatch::commit(json!({"id": 1}), 42);
        assert_eq!(patch.data, PatchOp::Set(json!({"id": 1})));
        assert_eq!(patch.error, PatchOp::<Value>::Clear);
        assert_eq!(patch.timestamp, Some(42));
    }

    #[test]
    fn test_has_any_tag() {
        let mut entry = CacheEntry::new(None);
        entry.tags = vec![SmolStr::new("posts"), SmolStr::new("feed")];
        assert!(entry.has_any_tag(&[SmolStr::new("feed")]));
        assert!(!entry.has_any_tag(&[SmolStr::new("users")]));
        assert!(!entry.has_any_tag(&[]));
    }
}
