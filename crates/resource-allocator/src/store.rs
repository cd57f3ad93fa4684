use crate::error::{AllocationError, AllocationResult};
use async_trait::async_trait;
use chrono::Utc;
use intentmesh_types::{
    AllocationMetrics, AllocationRequest, AllocationStatus, ResourceAllocation,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Everything kept about one allocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub allocation: ResourceAllocation,

    /// Request the allocation was made for; rebinding re-reads it
    pub request: AllocationRequest,

    /// Metrics computed when the allocation was last published
    #[serde(default)]
    pub metrics: Option<AllocationMetrics>,

    /// Warnings collected while allocating
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl AllocationRecord {
    /// Record for an allocation that has not bound anything yet
    pub fn pending(allocation_id: &str, request: AllocationRequest) -> Self {
        let allocation = ResourceAllocation::assemble(
            allocation_id,
            &request,
            AllocationStatus::Pending,
            Vec::new(),
            0.0,
        );
        Self {
            allocation,
            request,
            metrics: None,
            warnings: Vec::new(),
        }
    }

    pub fn status(&self) -> AllocationStatus {
        self.allocation.status
    }
}

/// Storage for allocation records.
///
/// Status changes go through `transition` or `publish`, both of which check
/// the lifecycle rules; a record is never edited in place by callers.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Add a new record; fails if the id is taken
    async fn insert(&self, record: AllocationRecord) -> AllocationResult<()>;

    async fn get(&self, allocation_id: &str) -> AllocationResult<Option<AllocationRecord>>;

    /// Move an allocation to `next`, recording `note` as its last error if given
    async fn transition(
        &self,
        allocation_id: &str,
        next: AllocationStatus,
        note: Option<String>,
    ) -> AllocationResult<AllocationRecord>;

    /// Replace a record if its current status is still `expected`
    async fn publish(
        &self,
        allocation_id: &str,
        expected: AllocationStatus,
        record: AllocationRecord,
    ) -> AllocationResult<AllocationRecord>;

    async fn set_execution_handle(
        &self,
        allocation_id: &str,
        handle: String,
    ) -> AllocationResult<AllocationRecord>;

    /// Increment the rebinding counter of a step
    async fn record_rebind_attempt(
        &self,
        allocation_id: &str,
        step_id: &str,
    ) -> AllocationResult<u32>;

    async fn list(&self) -> AllocationResult<Vec<AllocationRecord>>;

    async fn remove(&self, allocation_id: &str) -> AllocationResult<Option<AllocationRecord>>;
}

/// In-memory allocation store
pub struct InMemoryAllocationStore {
    records: RwLock<HashMap<String, AllocationRecord>>,
}

impl InMemoryAllocationStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAllocationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AllocationStore for InMemoryAllocationStore {
    async fn insert(&self, record: AllocationRecord) -> AllocationResult<()> {
        let mut records = self.records.write().await;
        let id = record.allocation.allocation_id.clone();
        if records.contains_key(&id) {
            return Err(AllocationError::Internal(format!(
                "allocation {} already exists",
                id
            )));
        }
        records.insert(id, record);
        Ok(())
    }

    async fn get(&self, allocation_id: &str) -> AllocationResult<Option<AllocationRecord>> {
        let records = self.records.read().await;
        Ok(records.get(allocation_id).cloned())
    }

    async fn transition(
        &self,
        allocation_id: &str,
        next: AllocationStatus,
        note: Option<String>,
    ) -> AllocationResult<AllocationRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(allocation_id)
            .ok_or_else(|| AllocationError::NotFound(allocation_id.to_string()))?;

        let current = record.allocation.status;
        if !current.can_transition_to(next) {
            return Err(AllocationError::InvalidTransition {
                from: current,
                to: next,
            });
        }

        record.allocation.status = next;
        record.allocation.updated_at = Utc::now();
        if note.is_some() {
            record.allocation.last_error = note;
        }
        Ok(record.clone())
    }

    async fn publish(
        &self,
        allocation_id: &str,
        expected: AllocationStatus,
        record: AllocationRecord,
    ) -> AllocationResult<AllocationRecord> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(allocation_id)
            .ok_or_else(|| AllocationError::NotFound(allocation_id.to_string()))?;

        let from = current.allocation.status;
        let to = record.allocation.status;
        if from != expected || (from != to && !from.can_transition_to(to)) {
            return Err(AllocationError::InvalidTransition { from, to });
        }

        *current = record;
        current.allocation.updated_at = Utc::now();
        Ok(current.clone())
    }

    async fn set_execution_handle(
        &self,
        allocation_id: &str,
        handle: String,
    ) -> AllocationResult<AllocationRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(allocation_id)
            .ok_or_else(|| AllocationError::NotFound(allocation_id.to_string()))?;
        record.allocation.execution_handle = Some(handle);
        record.allocation.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn record_rebind_attempt(
        &self,
        allocation_id: &str,
        step_id: &str,
    ) -> AllocationResult<u32> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(allocation_id)
            .ok_or_else(|| AllocationError::NotFound(allocation_id.to_string()))?;
        let attempts = record
            .allocation
            .rebind_attempts
            .entry(step_id.to_string())
            .or_insert(0);
        *attempts += 1;
        Ok(*attempts)
    }

    async fn list(&self) -> AllocationResult<Vec<AllocationRecord>> {
        let records = self.records.read().await;
        let mut list: Vec<AllocationRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.allocation.created_at.cmp(&b.allocation.created_at));
        Ok(list)
    }

    async fn remove(&self, allocation_id: &str) -> AllocationResult<Option<AllocationRecord>> {
        let mut records = self.records.write().await;
        Ok(records.remove(allocation_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use intentmesh_types::ExecutionPlan;

    fn create_test_record(id: &str) -> AllocationRecord {
        let request = AllocationRequest::new(ExecutionPlan::new("plan-1", vec![]), "user-1");
        AllocationRecord::pending(id, request)
    }

    #[tokio::test]
    async fn test_transition_follows_lifecycle() {
        let store = InMemoryAllocationStore::new();
        store.insert(create_test_record("a1")).await.unwrap();

        store
            .transition("a1", AllocationStatus::FeasibilityCheck, None)
            .await
            .unwrap();
        let err = store
            .transition("a1", AllocationStatus::Dispatched, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AllocationError::InvalidTransition { .. }));

        let failed = store
            .transition("a1", AllocationStatus::Failed, Some("boom".to_string()))
            .await
            .unwrap();
        assert_eq!(failed.status(), AllocationStatus::Failed);
        assert_eq!(failed.allocation.last_error.as_deref(), Some("boom"));

        // terminal states stay terminal
        assert!(store
            .transition("a1", AllocationStatus::Cancelled, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_publish_is_compare_and_swap() {
        let store = InMemoryAllocationStore::new();
        store.insert(create_test_record("a1")).await.unwrap();

        let mut next = create_test_record("a1");
        next.allocation.status = AllocationStatus::FeasibilityCheck;

        // wrong expectation leaves the record alone
        assert!(store
            .publish("a1", AllocationStatus::Binding, next.clone())
            .await
            .is_err());
        assert_eq!(
            store.get("a1").await.unwrap().unwrap().status(),
            AllocationStatus::Pending
        );

        let published = store
            .publish("a1", AllocationStatus::Pending, next)
            .await
            .unwrap();
        assert_eq!(published.status(), AllocationStatus::FeasibilityCheck);
    }

    #[tokio::test]
    async fn test_duplicate_insert_and_missing_ids() {
        let store = InMemoryAllocationStore::new();
        store.insert(create_test_record("a1")).await.unwrap();
        assert!(store.insert(create_test_record("a1")).await.is_err());

        assert!(store.get("missing").await.unwrap().is_none());
        assert!(matches!(
            store.transition("missing", AllocationStatus::Failed, None).await,
            Err(AllocationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rebind_counter() {
        let store = InMemoryAllocationStore::new();
        store.insert(create_test_record("a1")).await.unwrap();

        assert_eq!(store.record_rebind_attempt("a1", "s1").await.unwrap(), 1);
        assert_eq!(store.record_rebind_attempt("a1", "s1").await.unwrap(), 2);
        let record = store.get("a1").await.unwrap().unwrap();
        assert_eq!(record.allocation.rebind_attempts_for("s1"), 2);
    }
}
