use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MS_PER_HOUR: Ms = 3_600_000;
pub const MS_PER_DAY: Ms = 86_400_000;

/// Half-open booking window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// A mark-ended cancellation can leave `end <= start`; such a window
    /// occupies nothing and must never count as a conflict.
    pub fn is_degenerate(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// UTC calendar day index for the same-day booking policy.
pub fn day_index(t: Ms) -> i64 {
    t.div_euclid(MS_PER_DAY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

/// Cached occupancy flag. Advisory only — the reservation timeline is
/// authoritative; this flag converges via mutations and the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpotStatus {
    Available,
    Occupied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Booked,
    CheckedOut,
    Cancelled,
}

/// One time-bounded claim on one spot by one user. The window end is set at
/// booking time (strict flow); checkout/cancel truncate it to the earlier of
/// "now" and the booked end, never extending it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub spot_id: Ulid,
    pub user_id: Ulid,
    pub window: Window,
    pub cost: Option<f64>,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub state: ReservationState,
}

impl Reservation {
    /// Whether this reservation blocks `window` on its spot. Full history
    /// counts — a future-dated booking blocks double-booking — but
    /// degenerate (cancelled-before-start) windows never do.
    pub fn blocks(&self, window: &Window) -> bool {
        !self.window.is_degenerate() && self.window.overlaps(window)
    }
}

#[derive(Debug, Clone)]
pub struct LotState {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub pin_code: String,
    /// Hourly rate.
    pub price: f64,
    /// Spot-creation cap; the engine never exceeds it.
    pub max_spots: u32,
}

#[derive(Debug, Clone)]
pub struct SpotState {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub status: SpotStatus,
    /// Full reservation timeline, sorted by `window.start`.
    pub reservations: Vec<Reservation>,
}

impl SpotState {
    pub fn new(id: Ulid, lot_id: Ulid) -> Self {
        Self {
            id,
            lot_id,
            status: SpotStatus::Available,
            reservations: Vec::new(),
        }
    }

    /// Insert keeping sort order by window start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.window.start, |r| r.window.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations whose window overlaps the query, bounded by binary search
    /// on the sorted start times.
    pub fn overlapping(&self, query: &Window) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.window.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.window.end > query.start)
    }

    /// What the cached flag should read right now, derived from the timeline.
    pub fn derived_status(&self, now: Ms) -> SpotStatus {
        let occupied = self
            .reservations
            .iter()
            .any(|r| r.state == ReservationState::Booked && r.window.contains_instant(now));
        if occupied {
            SpotStatus::Occupied
        } else {
            SpotStatus::Available
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserState {
    pub id: Ulid,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}

/// WAL record format — flat, no nesting. Cached spot status is deliberately
/// absent: it is derived from the timeline on replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        username: String,
        password_hash: String,
        role: Role,
    },
    UserDeleted {
        id: Ulid,
    },
    LotCreated {
        id: Ulid,
        name: String,
        address: String,
        pin_code: String,
        price: f64,
        max_spots: u32,
    },
    LotUpdated {
        id: Ulid,
        name: String,
        address: String,
        pin_code: String,
        price: f64,
    },
    LotDeleted {
        id: Ulid,
    },
    SpotAdded {
        id: Ulid,
        lot_id: Ulid,
    },
    SpotRemoved {
        id: Ulid,
        lot_id: Ulid,
    },
    ReservationBooked {
        id: Ulid,
        spot_id: Ulid,
        user_id: Ulid,
        window: Window,
        cost: f64,
        rating: Option<u8>,
        feedback: Option<String>,
    },
    CheckedOut {
        id: Ulid,
        spot_id: Ulid,
        at: Ms,
    },
    Cancelled {
        id: Ulid,
        spot_id: Ulid,
        at: Ms,
    },
    RatingSubmitted {
        id: Ulid,
        spot_id: Ulid,
        rating: u8,
        feedback: Option<String>,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookingSummary {
    pub id: Ulid,
    pub spot_id: Ulid,
    pub lot_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub cost: Option<f64>,
    pub rating: Option<u8>,
    pub state: ReservationState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LotSummary {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub pin_code: String,
    pub price: f64,
    pub total_spots: usize,
    pub available_spots: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotSummary {
    pub id: Ulid,
    pub lot_id: Ulid,
    pub status: SpotStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub lots: usize,
    pub users: usize,
    pub total_spots: usize,
    pub occupied_spots: usize,
    pub total_revenue: f64,
}
