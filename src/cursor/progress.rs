use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;

use super::{CursorStore, STEP_SCOPE_PREFIX, decode, encode};
use crate::errors::StoreError;

/// Step-local sub-progress, persisted under `step.<name>.<key>`.
///
/// A step that does several things (build, then upload to N destinations)
/// records how far it got here so a retried attempt can pick up from there.
/// The driver never reads these keys.
#[derive(Clone)]
pub struct StepProgress {
    store: Arc<dyn CursorStore>,
    prefix: String,
}

impl StepProgress {
    pub(crate) fn new(store: Arc<dyn CursorStore>, step_name: &str) -> Self {
        Self {
            store,
            prefix: format!("{}{}.", STEP_SCOPE_PREFIX, step_name),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let full = self.key(key);
        match self.store.get(&full)? {
            Some(value) => decode(&full, value).map(Some),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let full = self.key(key);
        let value = encode(&full, value)?;
        self.store.set(&full, value)
    }

    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.get(key)
    }

    pub fn set_u64(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.set(key, &value)
    }

    /// Drop everything this step recorded.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.remove_prefix(&self.prefix)
    }
}
