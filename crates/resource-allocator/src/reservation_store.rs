use async_trait::async_trait;
use chrono::{DateTime, Utc};
use intentmesh_types::ResourceReservation;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors raised when taking or managing reservations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReservationError {
    #[error("resource {resource_id} is exclusively held by reservation {existing}")]
    ExclusiveConflict { resource_id: String, existing: String },

    #[error("resource {resource_id} is at capacity ({in_use} of {capacity} slots in use)")]
    CapacityExceeded {
        resource_id: String,
        in_use: u32,
        capacity: u32,
    },

    #[error("invalid reservation window: {0}")]
    InvalidWindow(String),

    #[error("reservation store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for resource reservations.
///
/// `try_reserve` is the only way in: the overlap check and the insert happen
/// as one atomic step, so two callers can never both win the same window.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Admit a reservation if its window fits the resource's capacity
    async fn try_reserve(
        &self,
        reservation: ResourceReservation,
        capacity: u32,
    ) -> Result<ResourceReservation, ReservationError>;

    /// Remove reservations by id; returns how many were removed
    async fn release(&self, reservation_ids: &[String]) -> Result<usize, ReservationError>;

    /// Remove every reservation owned by an allocation
    async fn release_allocation(
        &self,
        allocation_id: &str,
    ) -> Result<Vec<ResourceReservation>, ReservationError>;

    /// Flag reservations as consumed by dispatch; returns how many matched
    async fn mark_consumed(&self, reservation_ids: &[String]) -> Result<usize, ReservationError>;

    /// Remove and return reservations not consumed before their deadline
    async fn expire_unconsumed(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceReservation>, ReservationError>;

    async fn reservations_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceReservation>, ReservationError>;

    async fn reservations_for_allocation(
        &self,
        allocation_id: &str,
    ) -> Result<Vec<ResourceReservation>, ReservationError>;

    /// Every held reservation
    async fn all(&self) -> Result<Vec<ResourceReservation>, ReservationError>;

    async fn active_count(&self) -> Result<usize, ReservationError>;
}

/// In-memory reservation store
pub struct InMemoryReservationStore {
    /// Reservations indexed by resource id
    by_resource: Mutex<HashMap<String, Vec<ResourceReservation>>>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self {
            by_resource: Mutex::new(HashMap::new()),
        }
    }

    fn admit(
        held: &[ResourceReservation],
        candidate: &ResourceReservation,
        capacity: u32,
    ) -> Result<(), ReservationError> {
        let overlapping: Vec<&ResourceReservation> =
            held.iter().filter(|r| r.overlaps(candidate)).collect();

        if let Some(existing) = overlapping
            .iter()
            .find(|r| r.exclusive || candidate.exclusive)
        {
            return Err(ReservationError::ExclusiveConflict {
                resource_id: candidate.resource_id.clone(),
                existing: existing.reservation_id.clone(),
            });
        }

        let in_use = peak_concurrency(&overlapping, candidate);
        if in_use + 1 > capacity {
            return Err(ReservationError::CapacityExceeded {
                resource_id: candidate.resource_id.clone(),
                in_use,
                capacity,
            });
        }

        Ok(())
    }
}

/// Most holders active at once inside the candidate's window
fn peak_concurrency(holders: &[&ResourceReservation], candidate: &ResourceReservation) -> u32 {
    let mut edges: Vec<(DateTime<Utc>, i32)> = Vec::with_capacity(holders.len() * 2);
    for holder in holders {
        edges.push((holder.start_time.max(candidate.start_time), 1));
        edges.push((holder.end_time.min(candidate.end_time), -1));
    }
    // ends sort before starts at the same instant; windows are half-open
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut active = 0i32;
    let mut peak = 0i32;
    for (_, delta) in edges {
        active += delta;
        peak = peak.max(active);
    }
    peak.max(0) as u32
}

impl Default for InMemoryReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn try_reserve(
        &self,
        reservation: ResourceReservation,
        capacity: u32,
    ) -> Result<ResourceReservation, ReservationError> {
        if reservation.end_time <= reservation.start_time {
            return Err(ReservationError::InvalidWindow(format!(
                "reservation {} ends at {} which is not after its start {}",
                reservation.reservation_id, reservation.end_time, reservation.start_time
            )));
        }

        let mut by_resource = self.by_resource.lock().await;
        let held = by_resource
            .entry(reservation.resource_id.clone())
            .or_insert_with(Vec::new);

        Self::admit(held, &reservation, capacity)?;
        held.push(reservation.clone());
        Ok(reservation)
    }

    async fn release(&self, reservation_ids: &[String]) -> Result<usize, ReservationError> {
        let mut by_resource = self.by_resource.lock().await;
        let mut removed = 0;

        for held in by_resource.values_mut() {
            let before = held.len();
            held.retain(|r| !reservation_ids.contains(&r.reservation_id));
            removed += before - held.len();
        }
        by_resource.retain(|_, held| !held.is_empty());

        Ok(removed)
    }

    async fn release_allocation(
        &self,
        allocation_id: &str,
    ) -> Result<Vec<ResourceReservation>, ReservationError> {
        let mut by_resource = self.by_resource.lock().await;
        let mut released = Vec::new();

        for held in by_resource.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = held
                .drain(..)
                .partition(|r| r.allocation_id == allocation_id);
            *held = kept;
            released.extend(gone);
        }
        by_resource.retain(|_, held| !held.is_empty());

        Ok(released)
    }

    async fn mark_consumed(&self, reservation_ids: &[String]) -> Result<usize, ReservationError> {
        let mut by_resource = self.by_resource.lock().await;
        let mut marked = 0;

        for reservation in by_resource.values_mut().flatten() {
            if reservation_ids.contains(&reservation.reservation_id) {
                reservation.consumed = true;
                marked += 1;
            }
        }

        Ok(marked)
    }

    async fn expire_unconsumed(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceReservation>, ReservationError> {
        let mut by_resource = self.by_resource.lock().await;
        let mut expired = Vec::new();

        for held in by_resource.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = held.drain(..).partition(|r| r.is_expired(now));
            *held = kept;
            expired.extend(gone);
        }
        by_resource.retain(|_, held| !held.is_empty());

        Ok(expired)
    }

    async fn reservations_for_resource(
        &self,
        resource_id: &str,
    ) -> Result<Vec<ResourceReservation>, ReservationError> {
        let by_resource = self.by_resource.lock().await;
        Ok(by_resource.get(resource_id).cloned().unwrap_or_default())
    }

    async fn reservations_for_allocation(
        &self,
        allocation_id: &str,
    ) -> Result<Vec<ResourceReservation>, ReservationError> {
        let by_resource = self.by_resource.lock().await;
        Ok(by_resource
            .values()
            .flatten()
            .filter(|r| r.allocation_id == allocation_id)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<ResourceReservation>, ReservationError> {
        let by_resource = self.by_resource.lock().await;
        let mut all: Vec<ResourceReservation> = by_resource.values().flatten().cloned().collect();
        all.sort_by(|a, b| {
            a.resource_id
                .cmp(&b.resource_id)
                .then(a.start_time.cmp(&b.start_time))
        });
        Ok(all)
    }

    async fn active_count(&self) -> Result<usize, ReservationError> {
        let by_resource = self.by_resource.lock().await;
        Ok(by_resource.values().map(Vec::len).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn create_test_reservation(
        id: &str,
        allocation_id: &str,
        resource_id: &str,
        start: DateTime<Utc>,
        minutes: i64,
        exclusive: bool,
    ) -> ResourceReservation {
        ResourceReservation {
            reservation_id: id.to_string(),
            allocation_id: allocation_id.to_string(),
            resource_id: resource_id.to_string(),
            step_id: "step-1".to_string(),
            start_time: start,
            end_time: start + Duration::minutes(minutes),
            priority: 50,
            exclusive,
            created_at: start,
            consume_by: start + Duration::minutes(30),
            consumed: false,
        }
    }

    #[tokio::test]
    async fn test_exclusive_reservations_never_overlap() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();

        store
            .try_reserve(create_test_reservation("r1", "a1", "lamp", now, 10, true), 1)
            .await
            .unwrap();

        let err = store
            .try_reserve(
                create_test_reservation("r2", "a2", "lamp", now + Duration::minutes(5), 10, true),
                1,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReservationError::ExclusiveConflict { ref existing, .. } if existing == "r1"
        ));

        // back-to-back windows do not overlap
        store
            .try_reserve(
                create_test_reservation("r3", "a2", "lamp", now + Duration::minutes(10), 10, true),
                1,
            )
            .await
            .unwrap();
        assert_eq!(store.active_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shared_capacity() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();

        for i in 0..3 {
            store
                .try_reserve(
                    create_test_reservation(&format!("r{}", i), "a1", "hub", now, 10, false),
                    3,
                )
                .await
                .unwrap();
        }

        let err = store
            .try_reserve(create_test_reservation("r4", "a2", "hub", now, 10, false), 3)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ReservationError::CapacityExceeded {
                resource_id: "hub".to_string(),
                in_use: 3,
                capacity: 3,
            }
        );

        // an exclusive claim cannot join shared holders either
        let err = store
            .try_reserve(create_test_reservation("r5", "a2", "hub", now, 10, true), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::ExclusiveConflict { .. }));
    }

    #[tokio::test]
    async fn test_shared_capacity_counts_concurrent_holders_only() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();

        store
            .try_reserve(create_test_reservation("early", "a1", "hub", now, 10, false), 2)
            .await
            .unwrap();
        store
            .try_reserve(
                create_test_reservation(
                    "late",
                    "a2",
                    "hub",
                    now + Duration::minutes(20),
                    10,
                    false,
                ),
                2,
            )
            .await
            .unwrap();

        // overlaps both holders, but never more than one of them at a time
        store
            .try_reserve(
                create_test_reservation(
                    "middle",
                    "a3",
                    "hub",
                    now + Duration::minutes(5),
                    20,
                    false,
                ),
                2,
            )
            .await
            .unwrap();

        // [8, 12) meets early and middle together, which fills both slots
        let err = store
            .try_reserve(
                create_test_reservation("busy", "a4", "hub", now + Duration::minutes(8), 4, false),
                2,
            )
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ReservationError::CapacityExceeded {
                resource_id: "hub".to_string(),
                in_use: 2,
                capacity: 2,
            }
        );

        // [10, 20) only meets middle once early has ended
        store
            .try_reserve(
                create_test_reservation("gap", "a5", "hub", now + Duration::minutes(10), 10, false),
                2,
            )
            .await
            .unwrap();
        assert_eq!(store.active_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_invalid_window_rejected() {
        let store = InMemoryReservationStore::new();
        let err = store
            .try_reserve(create_test_reservation("r1", "a1", "lamp", Utc::now(), 0, true), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::InvalidWindow(_)));
    }

    #[tokio::test]
    async fn test_release_and_allocation_sweep() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();

        store
            .try_reserve(create_test_reservation("r1", "a1", "lamp", now, 10, true), 1)
            .await
            .unwrap();
        store
            .try_reserve(create_test_reservation("r2", "a1", "hub", now, 10, false), 4)
            .await
            .unwrap();
        store
            .try_reserve(create_test_reservation("r3", "a2", "hub", now, 10, false), 4)
            .await
            .unwrap();

        assert_eq!(store.release(&["r3".to_string()]).await.unwrap(), 1);
        assert_eq!(store.release(&["r3".to_string()]).await.unwrap(), 0);

        let released = store.release_allocation("a1").await.unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(store.active_count().await.unwrap(), 0);
        assert!(store.reservations_for_allocation("a1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expiry_skips_consumed() {
        let store = InMemoryReservationStore::new();
        let now = Utc::now();

        store
            .try_reserve(create_test_reservation("r1", "a1", "lamp", now, 10, true), 1)
            .await
            .unwrap();
        store
            .try_reserve(create_test_reservation("r2", "a2", "fan", now, 10, true), 1)
            .await
            .unwrap();
        assert_eq!(store.mark_consumed(&["r2".to_string()]).await.unwrap(), 1);

        assert!(store.expire_unconsumed(now).await.unwrap().is_empty());

        let expired = store
            .expire_unconsumed(now + Duration::minutes(31))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].reservation_id, "r1");
        assert_eq!(store.reservations_for_resource("fan").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_single_winner() {
        let store = Arc::new(InMemoryReservationStore::new());
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .try_reserve(
                            create_test_reservation(
                                &format!("r{}", i),
                                &format!("a{}", i),
                                "lock",
                                now,
                                5,
                                true,
                            ),
                            1,
                        )
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let winners = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();
        assert_eq!(winners, 1);
    }
}
