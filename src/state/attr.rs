//! Defines the per-path attribute bag --- [`AttrBag`].
//!
//! The bag stores values of unrelated kinds (cached metadata, file-segment
//! descriptors) as a tagged variant, so consumers match instead of
//! downcasting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Bool(bool),
    U32(u32),
    U64(u64),
    Text(String),
    Bytes(Vec<u8>),
    /// Milliseconds since epoch.
    Time(u64),
    /// Descriptor of a file segment staged elsewhere (offline stores).
    Segment { offset: u64, length: u64, store_path: String },
}

/// String-keyed attribute mapping attached to a file state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttrBag(HashMap<String, AttrValue>);

impl AttrBag {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<AttrValue> {
        self.0.remove(key)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convenience accessor for `U64` attributes.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key) {
            Some(AttrValue::U64(value)) => Some(*value),
            _ => None,
        }
    }

    /// Convenience accessor for `Text` attributes.
    pub fn get_text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(AttrValue::Text(value)) => Some(value),
            _ => None,
        }
    }
}
