//! Minimal change-set between two scope snapshots.

use std::collections::BTreeMap;

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ScopeSnapshot;

/// Key used to mark a variable that left scope.
pub const REMOVED_MARKER: &str = "__removed__";

/// Key holding the value of an escaped object, see [`Change`]'s encoding.
pub const ESCAPED_VALUE: &str = "__value__";

/// One entry of a [`ScopeDiff`].
///
/// Serialized as the bare value, or `{"__removed__": true}` for a removal. A
/// value that is itself an object with a `__removed__` key is escaped as
/// `{"__removed__": false, "__value__": <value>}`, so a removal never
/// collides with user data.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The variable was introduced or now holds this value
    Set(Value),
    /// The variable is no longer in scope
    Removed,
}

impl Serialize for Change {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Change::Set(value) if needs_escape(value) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry(REMOVED_MARKER, &false)?;
                map.serialize_entry(ESCAPED_VALUE, value)?;
                map.end()
            }
            Change::Set(value) => value.serialize(serializer),
            Change::Removed => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(REMOVED_MARKER, &true)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Change {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let Value::Object(mut map) = value else {
            return Ok(Change::Set(value));
        };
        match (map.len(), map.get(REMOVED_MARKER)) {
            (1, Some(Value::Bool(true))) => Ok(Change::Removed),
            (2, Some(Value::Bool(false))) if map.contains_key(ESCAPED_VALUE) => Ok(Change::Set(
                map.remove(ESCAPED_VALUE).unwrap_or(Value::Null),
            )),
            _ => Ok(Change::Set(Value::Object(map))),
        }
    }
}

fn needs_escape(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.contains_key(REMOVED_MARKER))
}

/// Variables whose value changed, appeared, or disappeared between two snapshots.
///
/// Keys absent from the diff are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeDiff(BTreeMap<String, Change>);

impl ScopeDiff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, name: &str) -> Option<&Change> {
        self.0.get(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Change)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn insert(&mut self, name: impl Into<String>, change: Change) {
        self.0.insert(name.into(), change);
    }
}

/// Compute the change-set that turns `old` into `new`.
pub fn diff(old: &ScopeSnapshot, new: &ScopeSnapshot) -> ScopeDiff {
    let mut out = BTreeMap::new();

    for (name, value) in new {
        if old.get(name) != Some(value) {
            out.insert(name.clone(), Change::Set(value.clone()));
        }
    }
    for name in old.keys() {
        if !new.contains_key(name) {
            out.insert(name.clone(), Change::Removed);
        }
    }

    ScopeDiff(out)
}

/// Replay a change-set on top of a snapshot.
pub fn apply(base: &ScopeSnapshot, diff: &ScopeDiff) -> ScopeSnapshot {
    let mut out = base.clone();
    for (name, change) in &diff.0 {
        match change {
            Change::Set(value) => {
                out.insert(name.clone(), value.clone());
            }
            Change::Removed => {
                out.remove(name);
            }
        }
    }
    out
}
