//! In-memory order repository with per-order CAS.
//!
//! All mutations for one order serialise through the map's write lock;
//! `cas_assigned_driver` is the only way `assigned_driver_id` changes,
//! so an order can never be observed assigned to two drivers at once.

use crate::error::{CoreError, CoreResult};
use crate::ports::{OrderFilter, OrderPatch, OrderRepository};
use crate::types::{Order, OrderStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
pub struct InMemoryOrders {
    inner: RwLock<HashMap<String, Order>>,
}

impl InMemoryOrders {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Order>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Order>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn matches(order: &Order, filter: &OrderFilter) -> bool {
    if order.status.is_terminal() {
        return false;
    }
    if let Some(service) = filter.service_type {
        if order.service_type != service {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if order.status != status {
            return false;
        }
    }
    if let Some(driver) = &filter.assigned_to {
        if order.assigned_driver_id.as_deref() != Some(driver.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl OrderRepository for InMemoryOrders {
    async fn get_active(&self, filter: OrderFilter) -> CoreResult<Vec<Order>> {
        let mut active: Vec<Order> = self
            .read()
            .values()
            .filter(|o| matches(o, &filter))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(active)
    }

    async fn get_by_id(&self, id: &str) -> CoreResult<Option<Order>> {
        Ok(self.read().get(id).cloned())
    }

    async fn insert(&self, order: Order) -> CoreResult<()> {
        let mut map = self.write();
        if map.contains_key(&order.id) {
            return Err(CoreError::Invalid(format!("order '{}' already exists", order.id)));
        }
        map.insert(order.id.clone(), order);
        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        new_status: OrderStatus,
        patch: OrderPatch,
    ) -> CoreResult<Order> {
        let mut map = self.write();
        let order = map
            .get_mut(id)
            .ok_or_else(|| CoreError::Invalid(format!("order '{id}' not found")))?;

        order.status = new_status;
        // Monotonic flags: once raised, a patch can never lower them.
        if patch.sla_notified == Some(true) {
            order.sla_notified = true;
        }
        if patch.delay_notified == Some(true) {
            order.delay_notified = true;
        }
        if let Some(attempts) = patch.delivery_attempts {
            order.delivery_attempts = attempts;
        }
        if let Some(boost) = patch.priority_boost {
            order.priority_boost = Some(boost);
        }
        if let Some(service) = patch.service_type {
            order.service_type = service;
        }
        if let Some(at) = patch.delivered_at {
            order.delivered_at = Some(at);
        }
        Ok(order.clone())
    }

    async fn cas_assigned_driver(
        &self,
        id: &str,
        expected: Option<&str>,
        next: Option<&str>,
    ) -> CoreResult<bool> {
        let mut map = self.write();
        let order = map
            .get_mut(id)
            .ok_or_else(|| CoreError::Invalid(format!("order '{id}' not found")))?;

        if order.assigned_driver_id.as_deref() != expected {
            return Ok(false);
        }
        order.assigned_driver_id = next.map(str::to_string);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Location, ServiceType};
    use chrono::Utc;

    fn order(id: &str) -> Order {
        Order {
            id: id.into(),
            service_type: ServiceType::Express,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            promised_at: Utc::now(),
            pickup: Location::new(24.71, 46.67),
            delivery: Location::new(24.72, 46.68),
            priority: 5,
            assigned_driver_id: None,
            priority_boost: None,
            delivery_attempts: 0,
            leave_at_door: false,
            sla_notified: false,
            delay_notified: false,
            delivered_at: None,
        }
    }

    #[tokio::test]
    async fn cas_succeeds_then_conflicts() {
        let repo = InMemoryOrders::new();
        repo.insert(order("o1")).await.unwrap();

        assert!(repo.cas_assigned_driver("o1", None, Some("d1")).await.unwrap());
        // A second CAS expecting None must fail: d1 holds the order.
        assert!(!repo.cas_assigned_driver("o1", None, Some("d2")).await.unwrap());
        // Swap with the right expectation works.
        assert!(repo.cas_assigned_driver("o1", Some("d1"), Some("d2")).await.unwrap());
    }

    #[tokio::test]
    async fn monotonic_flags_never_lower() {
        let repo = InMemoryOrders::new();
        repo.insert(order("o1")).await.unwrap();

        let patched = repo
            .update_status(
                "o1",
                OrderStatus::Assigned,
                OrderPatch { sla_notified: Some(true), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(patched.sla_notified);

        let patched = repo
            .update_status(
                "o1",
                OrderStatus::Assigned,
                OrderPatch { sla_notified: Some(false), ..Default::default() },
            )
            .await
            .unwrap();
        assert!(patched.sla_notified, "sla_notified must stay raised");
    }

    #[tokio::test]
    async fn terminal_orders_drop_out_of_active() {
        let repo = InMemoryOrders::new();
        repo.insert(order("o1")).await.unwrap();
        repo.insert(order("o2")).await.unwrap();
        repo.update_status("o2", OrderStatus::Delivered, OrderPatch::default())
            .await
            .unwrap();

        let active = repo.get_active(OrderFilter::default()).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "o1");
    }
}
