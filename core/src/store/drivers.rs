//! In-memory driver repository.
//!
//! Attach/detach maintain the per-service active counters so capacity
//! checks stay a pure read. Stored Break/Offline status is never
//! overridden by workload bookkeeping.

use crate::error::{CoreError, CoreResult};
use crate::ports::DriverRepository;
use crate::types::{Capacity, Driver, DriverStatus, Location, ServiceType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

pub struct InMemoryDrivers {
    inner: RwLock<HashMap<String, Driver>>,
    capacity: Box<dyn Fn(&Driver) -> Capacity + Send + Sync>,
}

impl InMemoryDrivers {
    /// `capacity` resolves a driver's slot budget (normally from
    /// `CapacityConfig::for_vehicle`).
    pub fn new(capacity: impl Fn(&Driver) -> Capacity + Send + Sync + 'static) -> Self {
        Self { inner: RwLock::new(HashMap::new()), capacity: Box::new(capacity) }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Driver>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Driver>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DriverRepository for InMemoryDrivers {
    async fn list(&self) -> CoreResult<Vec<Driver>> {
        let mut drivers: Vec<Driver> = self.read().values().cloned().collect();
        drivers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(drivers)
    }

    async fn get_by_id(&self, id: &str) -> CoreResult<Option<Driver>> {
        Ok(self.read().get(id).cloned())
    }

    async fn insert(&self, driver: Driver) -> CoreResult<()> {
        let mut map = self.write();
        if map.contains_key(&driver.id) {
            return Err(CoreError::Invalid(format!("driver '{}' already exists", driver.id)));
        }
        map.insert(driver.id.clone(), driver);
        Ok(())
    }

    async fn update_location(
        &self,
        id: &str,
        location: Location,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut map = self.write();
        let driver = map
            .get_mut(id)
            .ok_or_else(|| CoreError::Invalid(format!("driver '{id}' not found")))?;
        driver.location = location;
        driver.location_at = at;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: DriverStatus) -> CoreResult<()> {
        let mut map = self.write();
        let driver = map
            .get_mut(id)
            .ok_or_else(|| CoreError::Invalid(format!("driver '{id}' not found")))?;
        driver.status = status;
        Ok(())
    }

    async fn attach_order(
        &self,
        driver_id: &str,
        order_id: &str,
        service: ServiceType,
    ) -> CoreResult<()> {
        let mut map = self.write();
        let driver = map
            .get_mut(driver_id)
            .ok_or_else(|| CoreError::Invalid(format!("driver '{driver_id}' not found")))?;

        let cap = (self.capacity)(driver);
        let class_load = match service {
            ServiceType::Express => driver.active_express,
            ServiceType::Standard => driver.active_standard,
        };
        if class_load >= cap.for_service(service) {
            return Err(CoreError::Fatal {
                invariant: "capacity_respected",
                detail: format!(
                    "driver '{driver_id}' at {class_load}/{} for {service:?}",
                    cap.for_service(service)
                ),
            });
        }

        driver.active_order_ids.push(order_id.to_string());
        match service {
            ServiceType::Express => driver.active_express += 1,
            ServiceType::Standard => driver.active_standard += 1,
        }
        driver.orders_today += 1;

        if driver.active_count() >= cap.total() {
            driver.status = DriverStatus::Full;
        } else if driver.status == DriverStatus::Available {
            driver.status = DriverStatus::Busy;
        }
        Ok(())
    }

    async fn detach_order(
        &self,
        driver_id: &str,
        order_id: &str,
        service: ServiceType,
    ) -> CoreResult<()> {
        let mut map = self.write();
        let driver = map
            .get_mut(driver_id)
            .ok_or_else(|| CoreError::Invalid(format!("driver '{driver_id}' not found")))?;

        let before = driver.active_order_ids.len();
        driver.active_order_ids.retain(|id| id != order_id);
        if driver.active_order_ids.len() == before {
            return Ok(()); // already detached; detach is idempotent
        }
        match service {
            ServiceType::Express => driver.active_express = driver.active_express.saturating_sub(1),
            ServiceType::Standard => {
                driver.active_standard = driver.active_standard.saturating_sub(1)
            }
        }

        // Workload bookkeeping never wakes a driver from break/offline.
        if matches!(driver.status, DriverStatus::Busy | DriverStatus::Full) {
            driver.status = if driver.active_order_ids.is_empty() {
                DriverStatus::Available
            } else {
                DriverStatus::Busy
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VehicleType;

    fn bike(id: &str) -> Driver {
        Driver {
            id: id.into(),
            vehicle_type: VehicleType::Bike,
            status: DriverStatus::Available,
            location: Location::new(24.71, 46.67),
            location_at: Utc::now(),
            active_order_ids: Vec::new(),
            active_express: 0,
            active_standard: 0,
            continuous_minutes: 60.0,
            orders_today: 0,
            last_break_at: None,
            battery: 90,
            rating: 4.5,
            express_success_rate: 0.95,
            estimated_completion_at: None,
        }
    }

    fn repo() -> InMemoryDrivers {
        InMemoryDrivers::new(|_| Capacity { express: 2, standard: 3 })
    }

    #[tokio::test]
    async fn attach_enforces_class_capacity() {
        let drivers = repo();
        drivers.insert(bike("d1")).await.unwrap();

        drivers.attach_order("d1", "o1", ServiceType::Express).await.unwrap();
        drivers.attach_order("d1", "o2", ServiceType::Express).await.unwrap();
        let err = drivers.attach_order("d1", "o3", ServiceType::Express).await;
        assert!(err.is_err(), "third express order must exceed the class cap");

        // The standard lane still has room.
        drivers.attach_order("d1", "o3", ServiceType::Standard).await.unwrap();
    }

    #[tokio::test]
    async fn detach_restores_availability() {
        let drivers = repo();
        drivers.insert(bike("d1")).await.unwrap();
        drivers.attach_order("d1", "o1", ServiceType::Express).await.unwrap();

        let busy = drivers.get_by_id("d1").await.unwrap().unwrap();
        assert_eq!(busy.status, DriverStatus::Busy);

        drivers.detach_order("d1", "o1", ServiceType::Express).await.unwrap();
        let free = drivers.get_by_id("d1").await.unwrap().unwrap();
        assert_eq!(free.status, DriverStatus::Available);
        assert!(free.active_order_ids.is_empty());
    }

    #[tokio::test]
    async fn detach_never_wakes_a_break() {
        let drivers = repo();
        drivers.insert(bike("d1")).await.unwrap();
        drivers.attach_order("d1", "o1", ServiceType::Standard).await.unwrap();
        drivers.update_status("d1", DriverStatus::Break).await.unwrap();

        drivers.detach_order("d1", "o1", ServiceType::Standard).await.unwrap();
        let driver = drivers.get_by_id("d1").await.unwrap().unwrap();
        assert_eq!(driver.status, DriverStatus::Break);
    }
}
