//! Variable-scope snapshots and the diff engine that compares them.

mod diff;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde_json::Value;

pub use diff::{apply, diff, Change, ScopeDiff, ESCAPED_VALUE, REMOVED_MARKER};

/// Variable name to serialized value, captured at one instant.
pub type ScopeSnapshot = BTreeMap<String, Value>;

/// Globals and locals of one frame at its last recorded event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameScopes {
    pub globals: ScopeSnapshot,
    pub locals: ScopeSnapshot,
}

impl FrameScopes {
    pub fn new(globals: ScopeSnapshot, locals: ScopeSnapshot) -> Self {
        Self { globals, locals }
    }

    /// Diff `current` against this reference, returning (global_diff, local_diff)
    pub fn diff_to(&self, current: &FrameScopes) -> (ScopeDiff, ScopeDiff) {
        (
            diff(&self.globals, &current.globals),
            diff(&self.locals, &current.locals),
        )
    }
}

/// Rolling per-frame snapshots.
///
/// An entry exists exactly while its frame is on the traced call stack: it is
/// seeded on `call`, refreshed on `line`, and dropped on `return`. Each entry
/// remembers the unit its frame runs in, since globals are per unit.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    frames: HashMap<u64, (PathBuf, FrameScopes)>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, frame_id: u64) -> Option<&FrameScopes> {
        self.frames.get(&frame_id).map(|(_, scopes)| scopes)
    }

    /// Snapshot of `frame_id`, but only if that frame runs in `unit`
    pub fn get_in(&self, frame_id: u64, unit: &Path) -> Option<&FrameScopes> {
        self.frames
            .get(&frame_id)
            .filter(|(frame_unit, _)| frame_unit == unit)
            .map(|(_, scopes)| scopes)
    }

    /// Seed a new frame's snapshot without clobbering an existing one
    pub fn seed(&mut self, frame_id: u64, unit: &Path, scopes: FrameScopes) {
        self.frames
            .entry(frame_id)
            .or_insert_with(|| (unit.to_path_buf(), scopes));
    }

    pub fn store(&mut self, frame_id: u64, unit: &Path, scopes: FrameScopes) {
        self.frames.insert(frame_id, (unit.to_path_buf(), scopes));
    }

    pub fn discard(&mut self, frame_id: u64) {
        self.frames.remove(&frame_id);
    }

    pub fn contains(&self, frame_id: u64) -> bool {
        self.frames.contains_key(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
