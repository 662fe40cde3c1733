use chrono::NaiveTime;
use ulid::Ulid;

use crate::model::{fmt_time, SlotKey};

/// Structural problems with a request or record, independent of stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyRequest,
    EndTimeMismatch {
        start: NaiveTime,
        end: NaiveTime,
        expected: NaiveTime,
    },
    InvalidPlate(String),
    InvalidRut(String),
    MissingField(&'static str),
    FieldTooLong(&'static str),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyRequest => write!(f, "at least one slot must be requested"),
            ValidationError::EndTimeMismatch { start, end, expected } => write!(
                f,
                "end time {} must be one hour after start {} (expected {})",
                fmt_time(*end),
                fmt_time(*start),
                fmt_time(*expected)
            ),
            ValidationError::InvalidPlate(p) => {
                write!(f, "invalid plate {p:?}: use groups of letters/digits joined by '-', e.g. RFWB-77")
            }
            ValidationError::InvalidRut(r) => {
                write!(f, "invalid RUT {r:?}: use XX.XXX.XXX-X")
            }
            ValidationError::MissingField(name) => write!(f, "{name} is required"),
            ValidationError::FieldTooLong(name) => write!(f, "{name} too long"),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    /// Requested start times that are not one of the day's slots.
    InvalidSlot(Vec<NaiveTime>),
    /// Slots already reserved. Nothing from the request was stored.
    Conflict(Vec<SlotKey>),
    Validation(ValidationError),
    VehicleNotFound(Ulid),
    UserNotFound(Ulid),
    AlreadyExists(Ulid),
    PlateTaken(String),
    /// The vehicle belongs to a different company than the user.
    NotAuthorized { vehicle_id: Ulid, user_id: Ulid },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Whether re-reading availability and trying again can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

fn join<T>(items: &[T], f: impl Fn(&T) -> String) -> String {
    items.iter().map(f).collect::<Vec<_>>().join(", ")
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidSlot(times) => {
                write!(f, "not a bookable slot: {}", join(times, |t| fmt_time(*t)))
            }
            EngineError::Conflict(keys) => write!(
                f,
                "already reserved: {}; refresh availability and try again",
                join(keys, |k| k.to_string())
            ),
            EngineError::Validation(e) => write!(f, "validation failed: {e}"),
            EngineError::VehicleNotFound(id) => write!(f, "vehicle not found: {id}"),
            EngineError::UserNotFound(id) => write!(f, "user not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::PlateTaken(plate) => write!(f, "plate already registered: {plate}"),
            EngineError::NotAuthorized { vehicle_id, user_id } => write!(
                f,
                "user {user_id} may not book vehicle {vehicle_id}: it belongs to another company"
            ),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
