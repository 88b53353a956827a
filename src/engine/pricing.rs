//! Pricing: hourly rate, fractional hours round up. Pure — callers have
//! already rejected non-positive durations.

use crate::model::{Ms, Window, MS_PER_HOUR};

/// Hours billed for a window: ceil(duration / 1h). A one-millisecond overage
/// charges a full extra hour; exact whole hours charge exactly.
pub(crate) fn billable_hours(window: &Window) -> Ms {
    (window.duration_ms() + MS_PER_HOUR - 1) / MS_PER_HOUR
}

pub(crate) fn booking_cost(hourly_rate: f64, window: &Window) -> f64 {
    hourly_rate * billable_hours(window) as f64
}
