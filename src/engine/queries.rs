use std::collections::HashMap;

use chrono::NaiveDate;

use crate::calendar;
use crate::model::*;

use super::{Engine, EngineError};

/// Map the day's reservations onto the calendar's slots.
fn slot_statuses(vs: &VehicleState, date: NaiveDate, viewer: Option<UserId>) -> Vec<SlotStatus> {
    let held: HashMap<_, _> = vs.day(date).map(|r| (r.start, r.user_id)).collect();
    calendar::day_slots()
        .into_iter()
        .map(|slot| {
            let booked_by = held.get(&slot.start).copied();
            SlotStatus {
                slot,
                booked_by,
                booked_by_viewer: booked_by.is_some() && booked_by == viewer,
            }
        })
        .collect()
}

fn display_order(a: &Vehicle, b: &Vehicle) -> std::cmp::Ordering {
    (&a.brand, &a.model, &a.plate).cmp(&(&b.brand, &b.model, &b.plate))
}

impl Engine {
    /// Free/booked status of each of the day's slots for one vehicle.
    /// `viewer` only affects `booked_by_viewer`.
    pub async fn slot_availability(
        &self,
        vehicle_id: VehicleId,
        date: NaiveDate,
        viewer: Option<UserId>,
    ) -> Result<Vec<SlotStatus>, EngineError> {
        let rs = self
            .store
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = rs.read().await;
        Ok(slot_statuses(&guard, date, viewer))
    }

    /// Availability of every active vehicle of the user's company, in
    /// brand/model/plate order, seen from that user.
    pub async fn company_availability(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> Result<Vec<VehicleAvailability>, EngineError> {
        let user = self
            .store
            .get_user(&user_id)
            .ok_or(EngineError::UserNotFound(user_id))?;

        let mut result = Vec::new();
        for (_, rs) in self.store.vehicles_sorted() {
            let guard = rs.read().await;
            if guard.vehicle.company != user.company || !guard.vehicle.is_active() {
                continue;
            }
            result.push(VehicleAvailability {
                vehicle: guard.vehicle.clone(),
                slots: slot_statuses(&guard, date, Some(user_id)),
            });
        }
        result.sort_by(|a, b| display_order(&a.vehicle, &b.vehicle));
        Ok(result)
    }

    /// One vehicle's reservations on one day, ordered by start.
    pub async fn reservations_for(
        &self,
        vehicle_id: VehicleId,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .store
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = rs.read().await;
        Ok(guard.day(date).cloned().collect())
    }

    /// Every reservation, ordered by date, start, then vehicle.
    pub async fn list_reservations(&self) -> Vec<Reservation> {
        let mut all = Vec::new();
        for (_, rs) in self.store.vehicles_sorted() {
            let guard = rs.read().await;
            all.extend(guard.reservations().cloned());
        }
        all.sort_by_key(|r| (r.date, r.start, r.vehicle_id));
        all
    }

    /// Vehicles, optionally only those of `company`, in brand/model/plate order.
    pub async fn list_vehicles(&self, company: Option<&str>) -> Vec<Vehicle> {
        let mut vehicles = Vec::new();
        for (_, rs) in self.store.vehicles_sorted() {
            let guard = rs.read().await;
            if company.is_none_or(|c| guard.vehicle.company == c) {
                vehicles.push(guard.vehicle.clone());
            }
        }
        vehicles.sort_by(display_order);
        vehicles
    }

    /// User profiles ordered by full name.
    pub fn list_users(&self) -> Vec<UserProfile> {
        let mut users = self.store.users();
        users.sort_by(|a, b| a.full_name.cmp(&b.full_name).then(a.id.cmp(&b.id)));
        users
    }
}
