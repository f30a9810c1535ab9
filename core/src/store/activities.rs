//! In-memory activity log — the audit trail tests and the runner read
//! back.

use crate::error::CoreResult;
use crate::ports::{ActivityRecord, ActivityRepository};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryActivities {
    records: Mutex<Vec<ActivityRecord>>,
}

impl InMemoryActivities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActivityRepository for InMemoryActivities {
    async fn append(&self, record: ActivityRecord) -> CoreResult<()> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> CoreResult<Vec<ActivityRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }

    async fn for_order(&self, order_id: &str) -> CoreResult<Vec<ActivityRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .filter(|r| r.order_id.as_deref() == Some(order_id))
            .cloned()
            .collect())
    }
}
