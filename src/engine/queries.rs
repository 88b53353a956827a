//! Read-only projections for the portal's dashboards. No invariant-bearing
//! logic lives here; availability always comes from the timeline, never from
//! the cached flag, when a concrete window is in play.

use std::sync::Arc;

use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::booking::check_no_conflict;
use super::{Engine, EngineError};

fn summarize(r: &Reservation, lot_id: Ulid) -> BookingSummary {
    BookingSummary {
        id: r.id,
        spot_id: r.spot_id,
        lot_id,
        start: r.window.start,
        end: r.window.end,
        cost: r.cost,
        rating: r.rating,
        state: r.state,
    }
}

impl Engine {
    pub fn find_user(&self, username: &str) -> Option<Arc<RwLock<UserState>>> {
        let id = self.usernames.get(username).map(|e| *e.value())?;
        self.get_user(&id)
    }

    /// Booked reservations for a user whose window has not yet ended —
    /// currently active plus future-scheduled, sorted by start.
    pub async fn active_bookings_for(&self, user_id: Ulid, now: Ms) -> Vec<BookingSummary> {
        let mut out = self
            .collect_user_bookings(user_id, |r| {
                r.state == ReservationState::Booked && r.window.end > now
            })
            .await;
        out.sort_by_key(|b| b.start);
        out
    }

    /// Full booking history for a user, newest first.
    pub async fn booking_history(&self, user_id: Ulid) -> Vec<BookingSummary> {
        let mut out = self.collect_user_bookings(user_id, |_| true).await;
        out.sort_by_key(|b| std::cmp::Reverse(b.start));
        out
    }

    /// Sum of booking costs for a user; a missing cost counts as zero.
    pub async fn total_spent(&self, user_id: Ulid) -> f64 {
        let mut total = 0.0;
        for entry in self.spots.iter() {
            let spot = entry.value().clone();
            let guard = spot.read().await;
            for r in &guard.reservations {
                if r.user_id == user_id {
                    total += r.cost.unwrap_or(0.0);
                }
            }
        }
        total
    }

    async fn collect_user_bookings(
        &self,
        user_id: Ulid,
        keep: impl Fn(&Reservation) -> bool,
    ) -> Vec<BookingSummary> {
        let mut out = Vec::new();
        for entry in self.spots.iter() {
            let spot = entry.value().clone();
            let guard = spot.read().await;
            for r in &guard.reservations {
                if r.user_id == user_id && keep(r) {
                    out.push(summarize(r, guard.lot_id));
                }
            }
        }
        out
    }

    /// Substring search over name/address (case-insensitive) and pin code.
    /// An empty query lists every lot. With a window, per-lot availability is
    /// the number of spots whose timeline does not block it; without one it
    /// falls back to the cached flag (display only).
    pub async fn search_lots(&self, query: &str, window: Option<Window>) -> Vec<LotSummary> {
        let needle = query.trim().to_lowercase();
        let mut out = Vec::new();
        for entry in self.lots.iter() {
            let lot = entry.value().clone();
            let guard = lot.read().await;
            let hit = needle.is_empty()
                || guard.name.to_lowercase().contains(&needle)
                || guard.address.to_lowercase().contains(&needle)
                || guard.pin_code.contains(needle.as_str());
            if !hit {
                continue;
            }

            let spot_ids = self
                .lot_spots
                .get(&guard.id)
                .map(|e| e.value().clone())
                .unwrap_or_default();
            let mut available = 0usize;
            for sid in &spot_ids {
                if self.spot_is_free(sid, window).await {
                    available += 1;
                }
            }
            out.push(LotSummary {
                id: guard.id,
                name: guard.name.clone(),
                address: guard.address.clone(),
                pin_code: guard.pin_code.clone(),
                price: guard.price,
                total_spots: spot_ids.len(),
                available_spots: available,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Spots in a lot that are free — for the given window via the interval
    /// test, or by cached flag when no window is requested.
    pub async fn available_spots(
        &self,
        lot_id: Ulid,
        window: Option<Window>,
    ) -> Result<Vec<SpotSummary>, EngineError> {
        if !self.lots.contains_key(&lot_id) {
            return Err(EngineError::NotFound(lot_id));
        }
        let spot_ids = self
            .lot_spots
            .get(&lot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for sid in spot_ids {
            if self.spot_is_free(&sid, window).await
                && let Some(spot) = self.get_spot(&sid)
            {
                let guard = spot.read().await;
                out.push(SpotSummary {
                    id: guard.id,
                    lot_id: guard.lot_id,
                    status: guard.status,
                });
            }
        }
        Ok(out)
    }

    /// Every spot in a lot with its cached status, for the admin overview.
    pub async fn spots_for_lot(&self, lot_id: Ulid) -> Result<Vec<SpotSummary>, EngineError> {
        if !self.lots.contains_key(&lot_id) {
            return Err(EngineError::NotFound(lot_id));
        }
        let spot_ids = self
            .lot_spots
            .get(&lot_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for sid in spot_ids {
            if let Some(spot) = self.get_spot(&sid) {
                let guard = spot.read().await;
                out.push(SpotSummary {
                    id: guard.id,
                    lot_id: guard.lot_id,
                    status: guard.status,
                });
            }
        }
        Ok(out)
    }

    async fn spot_is_free(&self, spot_id: &Ulid, window: Option<Window>) -> bool {
        let Some(spot) = self.get_spot(spot_id) else {
            return false;
        };
        let guard = spot.read().await;
        match window {
            Some(w) => check_no_conflict(&guard, &w).is_ok(),
            None => guard.status == SpotStatus::Available,
        }
    }

    /// Portal-wide aggregates for the admin dashboard.
    pub async fn dashboard_stats(&self) -> DashboardStats {
        let mut total_spots = 0usize;
        let mut occupied_spots = 0usize;
        let mut total_revenue = 0.0;
        for entry in self.spots.iter() {
            let spot = entry.value().clone();
            let guard = spot.read().await;
            total_spots += 1;
            if guard.status == SpotStatus::Occupied {
                occupied_spots += 1;
            }
            for r in &guard.reservations {
                total_revenue += r.cost.unwrap_or(0.0);
            }
        }
        DashboardStats {
            lots: self.lots.len(),
            users: self.users.len(),
            total_spots,
            occupied_spots,
            total_revenue,
        }
    }

    /// Most recent bookings across the portal, newest first — the activity
    /// feed on both dashboards.
    pub async fn recent_bookings(&self, limit: usize) -> Vec<BookingSummary> {
        let mut all = Vec::new();
        for entry in self.spots.iter() {
            let spot = entry.value().clone();
            let guard = spot.read().await;
            for r in &guard.reservations {
                all.push(summarize(r, guard.lot_id));
            }
        }
        all.sort_by_key(|b| std::cmp::Reverse(b.start));
        all.truncate(limit);
        all
    }

    /// Most recent bookings for one user, newest first — the feed on the
    /// user's own dashboard.
    pub async fn recent_bookings_for(&self, user_id: Ulid, limit: usize) -> Vec<BookingSummary> {
        let mut out = self.collect_user_bookings(user_id, |_| true).await;
        out.sort_by_key(|b| std::cmp::Reverse(b.start));
        out.truncate(limit);
        out
    }
}
