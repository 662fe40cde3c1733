use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveTime};

use crate::calendar;
use crate::model::*;

use super::error::ValidationError;
use super::EngineError;

/// Check requested start times against the calendar. Returns them sorted and
/// de-duplicated; any unknown start rejects the whole request.
pub(crate) fn validate_slots(starts: &[NaiveTime]) -> Result<Vec<NaiveTime>, EngineError> {
    if starts.is_empty() {
        return Err(ValidationError::EmptyRequest.into());
    }
    let requested: BTreeSet<NaiveTime> = starts.iter().copied().collect();
    let invalid: Vec<NaiveTime> = requested
        .iter()
        .copied()
        .filter(|t| !calendar::is_slot_start(*t))
        .collect();
    if !invalid.is_empty() {
        return Err(EngineError::InvalidSlot(invalid));
    }
    Ok(requested.into_iter().collect())
}

/// Shape checks for a fully formed reservation coming from outside the
/// booking path.
pub(crate) fn validate_reservation(r: &Reservation) -> Result<(), EngineError> {
    if !calendar::is_slot_start(r.start) {
        return Err(EngineError::InvalidSlot(vec![r.start]));
    }
    let expected = calendar::slot_end(r.start);
    if r.end != expected {
        return Err(ValidationError::EndTimeMismatch {
            start: r.start,
            end: r.end,
            expected,
        }
        .into());
    }
    Ok(())
}

/// Requested starts already held on `date`, by anyone.
pub(crate) fn find_conflicts(vs: &VehicleState, date: NaiveDate, starts: &[NaiveTime]) -> Vec<SlotKey> {
    starts
        .iter()
        .filter(|start| vs.holder(date, **start).is_some())
        .map(|start| SlotKey {
            vehicle_id: vs.id(),
            date,
            start: *start,
        })
        .collect()
}
