use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::model::*;

use super::conflict::validate_reservation;
use super::SharedVehicleState;

/// Vehicles (each with its own lock), user profiles and the plate index.
pub struct InMemoryStore {
    vehicles: DashMap<VehicleId, SharedVehicleState>,
    users: DashMap<UserId, UserProfile>,
    plates: DashMap<String, VehicleId>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            vehicles: DashMap::new(),
            users: DashMap::new(),
            plates: DashMap::new(),
        }
    }

    // ── Vehicles ─────────────────────────────────────────────

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    pub fn contains_vehicle(&self, id: &VehicleId) -> bool {
        self.vehicles.contains_key(id)
    }

    pub fn get_vehicle(&self, id: &VehicleId) -> Option<SharedVehicleState> {
        self.vehicles.get(id).map(|e| e.value().clone())
    }

    pub fn insert_vehicle(&self, vehicle: Vehicle) {
        self.plates.insert(vehicle.plate.clone(), vehicle.id);
        self.vehicles
            .insert(vehicle.id, Arc::new(RwLock::new(VehicleState::new(vehicle))));
    }

    /// Every vehicle, in id order. Taking locks in this order never deadlocks.
    pub fn vehicles_sorted(&self) -> Vec<(VehicleId, SharedVehicleState)> {
        let mut all: Vec<_> = self
            .vehicles
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn plate_owner(&self, plate: &str) -> Option<VehicleId> {
        self.plates.get(plate).map(|e| *e.value())
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn contains_user(&self, id: &UserId) -> bool {
        self.users.contains_key(id)
    }

    pub fn get_user(&self, id: &UserId) -> Option<UserProfile> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn insert_user(&self, user: UserProfile) {
        self.users.insert(user.id, user);
    }

    pub fn users(&self) -> Vec<UserProfile> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    // ── Replay ───────────────────────────────────────────────

    /// Apply a replayed WAL event. Nothing else holds the vehicle locks
    /// during replay, so `try_write` always succeeds.
    pub fn apply_event(&self, event: &Event) {
        match event {
            Event::VehicleRegistered(vehicle) => self.insert_vehicle(vehicle.clone()),
            Event::UserRegistered(user) => self.insert_user(user.clone()),
            Event::ReservationsCommitted { reservations } => {
                if let Err(reason) = self.replay_reservations(reservations) {
                    warn!("WAL replay: skipped reservation batch of {}: {reason}", reservations.len());
                }
            }
        }
    }

    fn replay_reservations(&self, reservations: &[Reservation]) -> Result<(), String> {
        let mut by_vehicle: BTreeMap<VehicleId, Vec<Reservation>> = BTreeMap::new();
        for r in reservations {
            validate_reservation(r).map_err(|e| e.to_string())?;
            by_vehicle.entry(r.vehicle_id).or_default().push(r.clone());
        }

        let mut guards = Vec::with_capacity(by_vehicle.len());
        for vid in by_vehicle.keys() {
            let rs = self
                .get_vehicle(vid)
                .ok_or_else(|| format!("unknown vehicle {vid}"))?;
            let guard = rs
                .try_write_owned()
                .map_err(|_| format!("vehicle {vid} locked during replay"))?;
            guards.push(guard);
        }

        for (guard, batch) in guards.iter().zip(by_vehicle.values()) {
            let violations = guard.unique_violations(batch);
            if !violations.is_empty() {
                return Err(format!("duplicate slot {}", violations[0]));
            }
        }
        for (mut guard, batch) in guards.into_iter().zip(by_vehicle.into_values()) {
            guard
                .insert_all(batch)
                .map_err(|v| format!("duplicate slot {}", v[0]))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::*;
    use ulid::Ulid;

    #[test]
    fn replay_skips_duplicate_batches() {
        let store = InMemoryStore::new();
        let v = vehicle("Acme", "RFWB-77");
        let vid = v.id;
        store.apply_event(&Event::VehicleRegistered(v));

        let d = date(2026, 5, 4);
        let first = Reservation::new(Ulid::new(), vid, Ulid::new(), d, hour(9));
        store.apply_event(&Event::ReservationsCommitted { reservations: vec![first.clone()] });
        store.apply_event(&Event::ReservationsCommitted {
            reservations: vec![
                Reservation::new(Ulid::new(), vid, Ulid::new(), d, hour(8)),
                Reservation::new(Ulid::new(), vid, Ulid::new(), d, hour(9)),
            ],
        });

        let rs = store.get_vehicle(&vid).unwrap();
        let guard = rs.try_read().unwrap();
        let day: Vec<_> = guard.day(d).cloned().collect();
        assert_eq!(day, vec![first]);
    }

    #[test]
    fn replay_skips_malformed_end_time() {
        let store = InMemoryStore::new();
        let v = vehicle("Acme", "RFWB-77");
        let vid = v.id;
        store.apply_event(&Event::VehicleRegistered(v));

        let mut r = Reservation::new(Ulid::new(), vid, Ulid::new(), date(2026, 5, 4), hour(9));
        r.end = hour(11);
        store.apply_event(&Event::ReservationsCommitted { reservations: vec![r] });

        let rs = store.get_vehicle(&vid).unwrap();
        assert_eq!(rs.try_read().unwrap().reservation_count(), 0);
    }

    #[test]
    fn plate_index_follows_vehicles() {
        let store = InMemoryStore::new();
        let v = vehicle("Acme", "RFWB-77");
        let vid = v.id;
        store.insert_vehicle(v);
        assert_eq!(store.plate_owner("RFWB-77"), Some(vid));
        assert_eq!(store.plate_owner("ZZZZ-99"), None);
        assert!(store.contains_vehicle(&vid));
        assert_eq!(store.vehicle_count(), 1);
    }
}
