//! Durable execution cursor.
//!
//! The cursor is the only state that survives a host restart. Its keys:
//!
//! | Key                  | Meaning                                          |
//! |----------------------|--------------------------------------------------|
//! | `step_index`         | index into the freshly assembled step list       |
//! | `retry_count`        | attempts at that index this pass, `-1` = none yet |
//! | `run_id`             | identifier of the run, for log correlation       |
//! | `started_at`         | when the run began                               |
//! | `step.<name>.<key>`  | step-local sub-progress                          |
//!
//! A present `step_index` means a run is in progress.

pub mod progress;
pub mod store;

pub use progress::StepProgress;
pub use store::{CursorStore, Entries, FileCursorStore, MemoryCursorStore};

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::StoreError;

pub const STEP_INDEX_KEY: &str = "step_index";
pub const RETRY_COUNT_KEY: &str = "retry_count";
pub const RUN_ID_KEY: &str = "run_id";
pub const STARTED_AT_KEY: &str = "started_at";
pub const STEP_SCOPE_PREFIX: &str = "step.";

/// Sentinel retry count meaning "not yet attempted this pass".
pub const NOT_ATTEMPTED: i64 = -1;

/// Position of an in-progress run.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub step_index: usize,
    pub retry_count: i64,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl Cursor {
    /// A cursor for a new run, positioned before `step_index` has been tried.
    pub fn fresh(step_index: usize) -> Self {
        Self {
            step_index,
            retry_count: NOT_ATTEMPTED,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    /// Number of attempts already started at the current index.
    pub fn attempts(&self) -> u32 {
        u32::try_from(self.retry_count.saturating_add(1).max(0)).unwrap_or(u32::MAX)
    }
}

/// Typed access to the cursor keys of a `CursorStore`.
#[derive(Clone)]
pub struct CursorManager {
    store: Arc<dyn CursorStore>,
}

impl CursorManager {
    pub fn new(store: Arc<dyn CursorStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CursorStore> {
        &self.store
    }

    /// Whether a run is in progress.
    pub fn exists(&self) -> Result<bool, StoreError> {
        Ok(self.store.get(STEP_INDEX_KEY)?.is_some())
    }

    pub fn load(&self) -> Result<Option<Cursor>, StoreError> {
        let Some(index) = self.store.get(STEP_INDEX_KEY)? else {
            return Ok(None);
        };
        let step_index = decode::<usize>(STEP_INDEX_KEY, index)?;
        let retry_count = match self.store.get(RETRY_COUNT_KEY)? {
            Some(v) => decode::<i64>(RETRY_COUNT_KEY, v)?,
            None => NOT_ATTEMPTED,
        };
        // The driver stores `retry_count + 1` next, so the maximum is unusable too.
        if retry_count < NOT_ATTEMPTED || retry_count == i64::MAX {
            return Err(StoreError::InvalidValue {
                key: RETRY_COUNT_KEY.to_string(),
                message: format!("{} is out of range", retry_count),
            });
        }
        // A cursor written before run ids existed still resumes.
        let run_id = match self.store.get(RUN_ID_KEY)? {
            Some(v) => decode::<Uuid>(RUN_ID_KEY, v)?,
            None => Uuid::nil(),
        };
        let started_at = match self.store.get(STARTED_AT_KEY)? {
            Some(v) => decode::<DateTime<Utc>>(STARTED_AT_KEY, v)?,
            None => Utc::now(),
        };
        Ok(Some(Cursor {
            step_index,
            retry_count,
            run_id,
            started_at,
        }))
    }

    /// Persist the cursor. Returns only once the write is durable.
    pub fn save(&self, cursor: &Cursor) -> Result<(), StoreError> {
        self.store.set_many(vec![
            (STEP_INDEX_KEY.to_string(), json!(cursor.step_index)),
            (RETRY_COUNT_KEY.to_string(), json!(cursor.retry_count)),
            (RUN_ID_KEY.to_string(), json!(cursor.run_id)),
            (STARTED_AT_KEY.to_string(), json!(cursor.started_at)),
        ])
    }

    /// Remove the cursor and all step-local sub-progress.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.store.clear()
    }

    /// Sub-progress handle scoped to one step.
    pub fn progress(&self, step_name: &str) -> StepProgress {
        StepProgress::new(self.store.clone(), step_name)
    }

    /// All step-local entries, keyed by their full store key.
    pub fn sub_progress(&self) -> Result<Entries, StoreError> {
        Ok(self
            .store
            .entries()?
            .into_iter()
            .filter(|(k, _)| k.starts_with(STEP_SCOPE_PREFIX))
            .collect())
    }
}

pub(crate) fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

pub(crate) fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|source| StoreError::Serialize {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> CursorManager {
        CursorManager::new(Arc::new(MemoryCursorStore::new()))
    }

    #[test]
    fn test_empty_store_has_no_cursor() {
        let mgr = manager();
        assert!(!mgr.exists().unwrap());
        assert!(mgr.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let mgr = manager();
        let mut cursor = Cursor::fresh(0);
        cursor.step_index = 3;
        cursor.retry_count = 1;
        mgr.save(&cursor).unwrap();

        let loaded = mgr.load().unwrap().unwrap();
        assert_eq!(loaded, cursor);
        assert_eq!(loaded.attempts(), 2);
    }

    #[test]
    fn test_fresh_cursor_is_not_attempted() {
        let cursor = Cursor::fresh(4);
        assert_eq!(cursor.step_index, 4);
        assert_eq!(cursor.retry_count, NOT_ATTEMPTED);
        assert_eq!(cursor.attempts(), 0);
    }

    #[test]
    fn test_clear_removes_cursor_and_sub_progress() {
        let mgr = manager();
        mgr.save(&Cursor::fresh(1)).unwrap();
        mgr.progress("publish:pc").set_u64("uploaded", 2).unwrap();

        mgr.clear().unwrap();
        assert!(!mgr.exists().unwrap());
        assert!(mgr.sub_progress().unwrap().is_empty());
    }

    #[test]
    fn test_load_tolerates_missing_optional_keys() {
        let mgr = manager();
        mgr.store().set(STEP_INDEX_KEY, json!(2)).unwrap();

        let cursor = mgr.load().unwrap().unwrap();
        assert_eq!(cursor.step_index, 2);
        assert_eq!(cursor.retry_count, NOT_ATTEMPTED);
        assert!(cursor.run_id.is_nil());
    }

    #[test]
    fn test_load_rejects_garbage_index() {
        let mgr = manager();
        mgr.store().set(STEP_INDEX_KEY, json!("two")).unwrap();
        assert!(matches!(
            mgr.load(),
            Err(StoreError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_load_rejects_out_of_range_retry_count() {
        for bad in [json!(-2), json!(i64::MAX)] {
            let mgr = manager();
            mgr.store().set(STEP_INDEX_KEY, json!(0)).unwrap();
            mgr.store().set(RETRY_COUNT_KEY, bad).unwrap();
            assert!(matches!(
                mgr.load(),
                Err(StoreError::InvalidValue { ref key, .. }) if key == RETRY_COUNT_KEY
            ));
        }
    }

    #[test]
    fn test_attempts_saturates() {
        let mut cursor = Cursor::fresh(0);
        cursor.retry_count = i64::MAX - 1;
        assert_eq!(cursor.attempts(), u32::MAX);
    }

    #[test]
    fn test_sub_progress_lists_only_step_keys() {
        let mgr = manager();
        mgr.save(&Cursor::fresh(0)).unwrap();
        mgr.progress("login").set_u64("attempt", 1).unwrap();

        let sub = mgr.sub_progress().unwrap();
        assert_eq!(sub.len(), 1);
        assert!(sub.contains_key("step.login.attempt"));
    }
}
