//! Hierarchical attribute scopes attached to graphs, operators, ports, and streams.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well-known attribute keys understood by the plan builder.
pub mod keys {
    /// Number of parallel replicas to create for an operator. Defaults to 1.
    pub const PARTITION_COUNT: &str = "partition.count";
    /// Size of the partition codec's key space. Defaults to the partition count.
    pub const PARTITION_KEY_SPACE: &str = "partition.keyspace";
    /// Interval between operator checkpoints, in milliseconds.
    pub const CHECKPOINT_INTERVAL_MILLIS: &str = "checkpoint.interval.millis";
    /// Upper bound on the number of containers a plan may occupy.
    pub const MAX_CONTAINERS: &str = "containers.max";
}

/// A typed attribute value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrValue {
    /// A signed integer value.
    Int(i64),
    /// A boolean value.
    Bool(bool),
    /// A string value.
    Str(String),
}

/// An ordered attribute map for one scope.
///
/// Backed by a `BTreeMap` so that iteration, and therefore serialization of any
/// descriptor embedding a copy of a scope, is deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    entries: BTreeMap<String, AttrValue>,
}

impl Attributes {
    /// Creates an empty attribute scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, replacing any previous value.
    pub fn set(&mut self, key: &str, value: AttrValue) {
        self.entries.insert(key.to_owned(), value);
    }

    /// The raw value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.entries.get(key)
    }

    /// The integer stored under `key`, if present and of that type.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(AttrValue::Int(x)) => Some(*x),
            _ => None,
        }
    }

    /// The boolean stored under `key`, if present and of that type.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.entries.get(key) {
            Some(AttrValue::Bool(x)) => Some(*x),
            _ => None,
        }
    }

    /// The string stored under `key`, if present and of that type.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(AttrValue::Str(x)) => Some(x.as_str()),
            _ => None,
        }
    }

    /// True iff the scope holds no attributes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}
