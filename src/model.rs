use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::calendar;

pub type VehicleId = Ulid;
pub type UserId = Ulid;
pub type ReservationId = Ulid;

/// `HH:MM`, the only way times are shown to clients.
pub fn fmt_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// One bookable block of a day. Derived, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Slot {
    /// Display label, e.g. `09:00 - 10:00`.
    pub fn label(&self) -> String {
        format!("{} - {}", fmt_time(self.start), fmt_time(self.end))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VehicleStatus {
    #[default]
    Active,
    Maintenance,
    Inactive,
}

impl VehicleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleStatus::Active => "active",
            VehicleStatus::Maintenance => "maintenance",
            VehicleStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for VehicleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" | "activo" => Ok(VehicleStatus::Active),
            "maintenance" | "mantenimiento" => Ok(VehicleStatus::Maintenance),
            "inactive" | "inactivo" => Ok(VehicleStatus::Inactive),
            other => Err(format!("unknown vehicle status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    /// Owning company. Users may only book vehicles of their own company.
    pub company: String,
    pub company2: Option<String>,
    /// Company tax id (`XX.XXX.XXX-X`), empty if unknown.
    pub rut: String,
    /// Normalized (upper case) license plate. Unique.
    pub plate: String,
    pub vehicle_type: String,
    pub brand: String,
    pub model: String,
    pub transmission: String,
    pub status: VehicleStatus,
}

impl Vehicle {
    pub fn is_active(&self) -> bool {
        self.status == VehicleStatus::Active
    }
}

/// Scheduling profile of a user. Identity and login live elsewhere; this only
/// carries what booking needs to know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub full_name: String,
    pub company: String,
    pub company2: Option<String>,
    pub rut: String,
    pub city: String,
}

/// One vehicle booked for one block by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub vehicle_id: VehicleId,
    pub user_id: UserId,
    pub date: NaiveDate,
    pub start: NaiveTime,
    /// Always `start + 1h`.
    pub end: NaiveTime,
}

impl Reservation {
    /// Build a reservation for the block starting at `start`; the end is derived.
    pub fn new(
        id: ReservationId,
        vehicle_id: VehicleId,
        user_id: UserId,
        date: NaiveDate,
        start: NaiveTime,
    ) -> Self {
        Self {
            id,
            vehicle_id,
            user_id,
            date,
            start,
            end: calendar::slot_end(start),
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey {
            vehicle_id: self.vehicle_id,
            date: self.date,
            start: self.start,
        }
    }
}

/// The uniqueness key of a reservation: one vehicle, one day, one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub vehicle_id: VehicleId,
    pub date: NaiveDate,
    pub start: NaiveTime,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date, fmt_time(self.start))
    }
}

/// Per-vehicle state: the vehicle record plus its reservation calendar.
///
/// The calendar is keyed by `(date, start)`, which makes the uniqueness
/// constraint structural and a day's reservations a single range read.
#[derive(Debug, Clone)]
pub struct VehicleState {
    pub vehicle: Vehicle,
    reservations: BTreeMap<(NaiveDate, NaiveTime), Reservation>,
}

impl VehicleState {
    pub fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            reservations: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> VehicleId {
        self.vehicle.id
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// All reservations, ordered by `(date, start)`.
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    /// Reservations of one day, ordered by start.
    pub fn day(&self, date: NaiveDate) -> impl Iterator<Item = &Reservation> {
        self.reservations
            .range((date, NaiveTime::MIN)..=(date, last_instant()))
            .map(|(_, r)| r)
    }

    pub fn holder(&self, date: NaiveDate, start: NaiveTime) -> Option<UserId> {
        self.reservations.get(&(date, start)).map(|r| r.user_id)
    }

    /// Keys in `batch` that would break uniqueness, against stored
    /// reservations or against an earlier entry of the same batch.
    pub fn unique_violations<'a>(
        &self,
        batch: impl IntoIterator<Item = &'a Reservation>,
    ) -> Vec<SlotKey> {
        let mut seen = std::collections::HashSet::new();
        let mut violations = Vec::new();
        for r in batch {
            let key = (r.date, r.start);
            if self.reservations.contains_key(&key) || !seen.insert(key) {
                violations.push(r.key());
            }
        }
        violations
    }

    /// Insert a batch only if none of it collides. Either every reservation
    /// is stored or none is.
    pub fn insert_all(&mut self, batch: Vec<Reservation>) -> Result<(), Vec<SlotKey>> {
        let violations = self.unique_violations(&batch);
        if !violations.is_empty() {
            return Err(violations);
        }
        for r in batch {
            self.reservations.insert((r.date, r.start), r);
        }
        Ok(())
    }
}

fn last_instant() -> NaiveTime {
    NaiveTime::from_hms_nano_opt(23, 59, 59, 1_999_999_999).unwrap_or(NaiveTime::MIN)
}

/// Status of one slot for one vehicle on one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    pub slot: Slot,
    pub booked_by: Option<UserId>,
    /// Set when the slot is held by the user the query was made for.
    pub booked_by_viewer: bool,
}

impl SlotStatus {
    pub fn is_free(&self) -> bool {
        self.booked_by.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleAvailability {
    pub vehicle: Vehicle,
    pub slots: Vec<SlotStatus>,
}

/// WAL record. A booking, however many slots it covers, is one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered(Vehicle),
    UserRegistered(UserProfile),
    ReservationsCommitted { reservations: Vec<Reservation> },
}
