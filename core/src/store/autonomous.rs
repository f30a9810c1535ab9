//! In-memory autonomous-action ledger.

use crate::error::CoreResult;
use crate::ports::{AutonomousActionRecord, AutonomousActionRepository};
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Default)]
pub struct InMemoryAutonomousActions {
    records: Mutex<Vec<AutonomousActionRecord>>,
}

impl InMemoryAutonomousActions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AutonomousActionRepository for InMemoryAutonomousActions {
    async fn append(&self, record: AutonomousActionRecord) -> CoreResult<()> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(record);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> CoreResult<Vec<AutonomousActionRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }
}
