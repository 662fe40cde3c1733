use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::{oneshot, OwnedRwLockWriteGuard};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{find_conflicts, validate_reservation, validate_slots};
use super::error::ValidationError;
use super::fields::{clean_user, clean_vehicle};
use super::{Engine, EngineError, WalCommand};

type WriteGuards = BTreeMap<VehicleId, OwnedRwLockWriteGuard<VehicleState>>;

impl Engine {
    /// Register a vehicle. Returns the stored record (plate normalized).
    pub async fn register_vehicle(&self, vehicle: Vehicle) -> Result<Vehicle, EngineError> {
        let vehicle = clean_vehicle(vehicle)?;
        let _registry = self.registry.lock().await;
        if self.store.vehicle_count() >= MAX_VEHICLES {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if self.store.contains_vehicle(&vehicle.id) {
            return Err(EngineError::AlreadyExists(vehicle.id));
        }
        if self.store.plate_owner(&vehicle.plate).is_some() {
            return Err(EngineError::PlateTaken(vehicle.plate));
        }

        self.wal_append(&Event::VehicleRegistered(vehicle.clone())).await?;
        self.store.insert_vehicle(vehicle.clone());
        info!("registered vehicle {} ({}) for {}", vehicle.id, vehicle.plate, vehicle.company);
        Ok(vehicle)
    }

    /// Register a user profile. Profiles are only ever created here, by an
    /// explicit call from the layer that owns user accounts.
    pub async fn register_user(&self, user: UserProfile) -> Result<UserProfile, EngineError> {
        let user = clean_user(user)?;
        let _registry = self.registry.lock().await;
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.store.contains_user(&user.id) {
            return Err(EngineError::AlreadyExists(user.id));
        }

        self.wal_append(&Event::UserRegistered(user.clone())).await?;
        self.store.insert_user(user.clone());
        info!("registered user {} ({})", user.id, user.company);
        Ok(user)
    }

    /// Book `starts` on `date` for `user_id`, all or nothing.
    ///
    /// Unknown slot starts are rejected before any state is touched. The
    /// conflict check, the WAL write and the in-memory insert all happen under
    /// the vehicle's write lock; if any requested slot is already held the
    /// whole request fails with [`EngineError::Conflict`] naming every taken
    /// slot, and nothing is stored.
    pub async fn book_slots(
        &self,
        vehicle_id: VehicleId,
        user_id: UserId,
        date: NaiveDate,
        starts: &[NaiveTime],
    ) -> Result<Vec<Reservation>, EngineError> {
        let starts = validate_slots(starts)?;

        let user = self
            .store
            .get_user(&user_id)
            .ok_or(EngineError::UserNotFound(user_id))?;
        let rs = self
            .store
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::VehicleNotFound(vehicle_id))?;
        let guard = rs.write_owned().await;

        if guard.vehicle.company != user.company {
            return Err(EngineError::NotAuthorized { vehicle_id, user_id });
        }

        let conflicts = find_conflicts(&guard, date, &starts);
        if !conflicts.is_empty() {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            debug!(
                "booking by {user_id} on {vehicle_id} {date} rejected: {} slot(s) taken",
                conflicts.len()
            );
            return Err(EngineError::Conflict(conflicts));
        }

        let reservations: Vec<Reservation> = starts
            .into_iter()
            .map(|start| Reservation::new(Ulid::new(), vehicle_id, user_id, date, start))
            .collect();

        let mut guards = WriteGuards::new();
        guards.insert(vehicle_id, guard);
        self.commit_reservations(&mut guards, reservations).await
    }

    /// Store reservations built elsewhere (e.g. a bulk loader). Each one is
    /// checked for shape and references, then the set is committed with the
    /// same all-or-nothing uniqueness guarantee as [`Engine::book_slots`].
    pub async fn import_reservations(
        &self,
        reservations: Vec<Reservation>,
    ) -> Result<Vec<Reservation>, EngineError> {
        if reservations.is_empty() {
            return Err(ValidationError::EmptyRequest.into());
        }
        if reservations.len() > MAX_IMPORT_SIZE {
            return Err(EngineError::LimitExceeded("import too large"));
        }
        for r in &reservations {
            validate_reservation(r)?;
            if !self.store.contains_user(&r.user_id) {
                return Err(EngineError::UserNotFound(r.user_id));
            }
        }

        // Acquire write locks in id order to avoid deadlocks with other
        // multi-vehicle writers.
        let mut vehicle_ids: Vec<VehicleId> = reservations.iter().map(|r| r.vehicle_id).collect();
        vehicle_ids.sort();
        vehicle_ids.dedup();

        let mut guards = WriteGuards::new();
        for vid in vehicle_ids {
            let rs = self
                .store
                .get_vehicle(&vid)
                .ok_or(EngineError::VehicleNotFound(vid))?;
            guards.insert(vid, rs.write_owned().await);
        }

        self.commit_reservations(&mut guards, reservations).await
    }

    /// Uniqueness check, durable write, apply. Callers hold the write lock of
    /// every vehicle in `reservations`.
    async fn commit_reservations(
        &self,
        guards: &mut WriteGuards,
        reservations: Vec<Reservation>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut by_vehicle: BTreeMap<VehicleId, Vec<Reservation>> = BTreeMap::new();
        for r in &reservations {
            by_vehicle.entry(r.vehicle_id).or_default().push(r.clone());
        }

        // Storage-level constraint on (vehicle, date, start).
        let mut violations = Vec::new();
        for (vid, batch) in &by_vehicle {
            let guard = guards
                .get(vid)
                .ok_or(EngineError::VehicleNotFound(*vid))?;
            violations.extend(guard.unique_violations(batch));
        }
        if !violations.is_empty() {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::Conflict(violations));
        }

        let event = Event::ReservationsCommitted {
            reservations: reservations.clone(),
        };
        self.wal_append(&event).await?;

        for (vid, batch) in by_vehicle {
            if let Some(guard) = guards.get_mut(&vid) {
                guard
                    .insert_all(batch)
                    .map_err(EngineError::Conflict)?;
            }
        }

        metrics::counter!(observability::RESERVATIONS_COMMITTED_TOTAL)
            .increment(reservations.len() as u64);
        if let Some(first) = reservations.first() {
            info!(
                "committed {} reservation(s), first {} on {}",
                reservations.len(),
                first.key(),
                first.vehicle_id
            );
        }
        Ok(reservations)
    }

    /// Rewrite the WAL as the minimal event list that recreates current state.
    ///
    /// Holds the registry lock and a read lock on every vehicle until the new
    /// file is in place, so no commit can land between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;

        let mut guards = Vec::new();
        for (_, rs) in self.store.vehicles_sorted() {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::VehicleRegistered(guard.vehicle.clone()));
        }
        let mut users = self.store.users();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(Event::UserRegistered));
        for guard in &guards {
            if guard.reservation_count() > 0 {
                events.push(Event::ReservationsCommitted {
                    reservations: guard.reservations().cloned().collect(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
