//! Hard limits. Requests past these are rejected with `LimitExceeded`
//! before touching the WAL.

use crate::model::Ms;

/// Earliest accepted timestamp: 2020-01-01T00:00:00Z.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 1_577_836_800_000;

/// Latest accepted timestamp: 2100-01-01T00:00:00Z.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A booking never spans more than a day.
pub const MAX_WINDOW_DURATION_MS: Ms = 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_ADDRESS_LEN: usize = 200;
pub const MAX_PIN_CODE_LEN: usize = 10;
pub const MAX_USERNAME_LEN: usize = 100;
pub const MAX_FEEDBACK_LEN: usize = 2_000;

/// Ratings are 1..=5 stars.
pub const MAX_RATING: u8 = 5;

pub const MAX_LOTS: usize = 10_000;
pub const MAX_SPOTS_PER_LOT: u32 = 10_000;
pub const MAX_RESERVATIONS_PER_SPOT: usize = 100_000;
pub const MAX_SPOTS_PER_BATCH: u32 = 1_000;
