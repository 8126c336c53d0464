//! In-memory storage backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use common_error::{StrataError, StrataResult};
use strata_core::Segment;

use crate::storage::Storage;

/// Hash-map backed storage for tests and small datasets.
///
/// Keys are kept in a `BTreeMap` so `list` is naturally ordered.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    segments: RwLock<BTreeMap<String, Segment>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored segments.
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn fetch(&self, key: &str) -> StrataResult<Segment> {
        self.segments
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| StrataError::storage(format!("no segment under key '{key}'")))
    }

    async fn write(&self, key: &str, segment: Segment) -> StrataResult<()> {
        self.segments.write().insert(key.to_string(), segment);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StrataResult<Vec<String>> {
        Ok(self
            .segments
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> StrataResult<()> {
        self.segments.write().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StrataResult<bool> {
        Ok(self.segments.read().contains_key(key))
    }
}
