//! Booking policy: window validation and conflict detection. Pure functions
//! evaluated while the caller holds the spot lock — this is what closes the
//! check-then-act race of a naive portal.

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Same-day booking policy. Rejects unless both endpoints fall on the current
/// UTC calendar day, the window has positive duration, and the start is not
/// already in the past. No side effects; runs before any conflict check.
pub(crate) fn validate_window(window: &Window, now: Ms) -> Result<(), EngineError> {
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.end <= window.start {
        return Err(EngineError::Validation("end time must be after start time"));
    }
    if window.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::LimitExceeded("window too wide"));
    }
    if day_index(window.start) != day_index(now) || day_index(window.end) != day_index(now) {
        return Err(EngineError::Validation("bookings are for the current day only"));
    }
    if window.start < now {
        return Err(EngineError::Validation("start time cannot be in the past"));
    }
    Ok(())
}

/// Half-open overlap scan over the spot's full timeline. Future-dated
/// reservations block double-booking; a window ending exactly where another
/// starts does not conflict. The cached status flag plays no part here.
pub(crate) fn check_no_conflict(spot: &SpotState, window: &Window) -> Result<(), EngineError> {
    for existing in spot.overlapping(window) {
        if existing.blocks(window) {
            return Err(EngineError::Conflict(existing.id));
        }
    }
    Ok(())
}
