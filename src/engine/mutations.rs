use std::sync::Arc;

use dashmap::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::auth::Principal;
use crate::limits::*;
use crate::model::*;

use super::booking::{check_no_conflict, now_ms, validate_window};
use super::pricing::booking_cost;
use super::{Engine, EngineError, WalCommand};

fn require_admin(actor: &Principal) -> Result<(), EngineError> {
    if actor.role == Role::Admin {
        Ok(())
    } else {
        Err(EngineError::AdminRequired)
    }
}

fn normalize_feedback(feedback: Option<String>) -> Result<Option<String>, EngineError> {
    match feedback {
        Some(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if trimmed.len() > MAX_FEEDBACK_LEN {
                return Err(EngineError::LimitExceeded("feedback too long"));
            }
            Ok(Some(trimmed.to_string()))
        }
        None => Ok(None),
    }
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(
        &self,
        username: &str,
        password_hash: String,
        role: Role,
    ) -> Result<Ulid, EngineError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(EngineError::Validation("username must not be empty"));
        }
        if username.len() > MAX_USERNAME_LEN {
            return Err(EngineError::LimitExceeded("username too long"));
        }

        // Claim the name before the WAL await — two concurrent registrations
        // of the same name must not both pass the uniqueness check.
        let id = Ulid::new();
        match self.usernames.entry(username.to_string()) {
            Entry::Occupied(_) => {
                return Err(EngineError::UsernameTaken(username.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let event = Event::UserRegistered {
            id,
            username: username.to_string(),
            password_hash: password_hash.clone(),
            role,
        };
        if let Err(e) = self.wal_append(&event).await {
            self.usernames.remove(username);
            return Err(e);
        }
        self.users.insert(
            id,
            Arc::new(RwLock::new(UserState {
                id,
                username: username.to_string(),
                password_hash,
                role,
            })),
        );
        info!("registered user {username} ({id})");
        Ok(id)
    }

    /// Admin-only. Cascades: the user's reservations are removed from every
    /// spot timeline, and affected cached flags are refreshed.
    pub async fn delete_user(&self, actor: &Principal, user_id: Ulid) -> Result<(), EngineError> {
        require_admin(actor)?;
        let user = self
            .get_user(&user_id)
            .ok_or(EngineError::NotFound(user_id))?;

        let event = Event::UserDeleted { id: user_id };
        self.wal_append(&event).await?;

        let username = user.read().await.username.clone();
        self.users.remove(&user_id);
        self.usernames.remove(&username);

        let now = now_ms();
        let spot_arcs: Vec<_> = self.spots.iter().map(|e| e.value().clone()).collect();
        for spot in spot_arcs {
            let mut guard = spot.write().await;
            let before = guard.reservations.len();
            guard.reservations.retain(|r| {
                let keep = r.user_id != user_id;
                if !keep {
                    self.reservation_to_spot.remove(&r.id);
                }
                keep
            });
            if guard.reservations.len() != before {
                guard.status = guard.derived_status(now);
            }
        }
        Ok(())
    }

    // ── Lots & spots (admin CRUD) ────────────────────────────

    pub async fn create_lot(
        &self,
        actor: &Principal,
        name: String,
        address: String,
        pin_code: String,
        price: f64,
        max_spots: u32,
    ) -> Result<Ulid, EngineError> {
        require_admin(actor)?;
        validate_lot_fields(&name, &address, &pin_code, price)?;
        if self.lots.len() >= MAX_LOTS {
            return Err(EngineError::LimitExceeded("too many lots"));
        }
        if max_spots == 0 || max_spots > MAX_SPOTS_PER_LOT {
            return Err(EngineError::LimitExceeded("lot capacity out of range"));
        }

        let id = Ulid::new();
        let event = Event::LotCreated {
            id,
            name: name.clone(),
            address: address.clone(),
            pin_code: pin_code.clone(),
            price,
            max_spots,
        };
        self.wal_append(&event).await?;
        self.lots.insert(
            id,
            Arc::new(RwLock::new(LotState {
                id,
                name,
                address,
                pin_code,
                price,
                max_spots,
            })),
        );
        self.lot_spots.entry(id).or_default();
        Ok(id)
    }

    pub async fn update_lot(
        &self,
        actor: &Principal,
        id: Ulid,
        name: String,
        address: String,
        pin_code: String,
        price: f64,
    ) -> Result<(), EngineError> {
        require_admin(actor)?;
        validate_lot_fields(&name, &address, &pin_code, price)?;
        let lot = self.get_lot(&id).ok_or(EngineError::NotFound(id))?;

        let event = Event::LotUpdated {
            id,
            name: name.clone(),
            address: address.clone(),
            pin_code: pin_code.clone(),
            price,
        };
        self.wal_append(&event).await?;
        let mut guard = lot.write().await;
        guard.name = name;
        guard.address = address;
        guard.pin_code = pin_code;
        guard.price = price;
        Ok(())
    }

    /// Admin-only. Cascades to the lot's spots and their reservations.
    pub async fn delete_lot(&self, actor: &Principal, id: Ulid) -> Result<(), EngineError> {
        require_admin(actor)?;
        if !self.lots.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::LotDeleted { id };
        self.wal_append(&event).await?;
        self.lots.remove(&id);
        if let Some((_, spot_ids)) = self.lot_spots.remove(&id) {
            for sid in spot_ids {
                self.retire_spot(&sid).await;
            }
        }
        Ok(())
    }

    /// Admin-only. Adds `count` spots, never exceeding the lot's capacity.
    pub async fn add_spots(
        &self,
        actor: &Principal,
        lot_id: Ulid,
        count: u32,
    ) -> Result<Vec<Ulid>, EngineError> {
        require_admin(actor)?;
        if count == 0 || count > MAX_SPOTS_PER_BATCH {
            return Err(EngineError::LimitExceeded("spot count out of range"));
        }
        let lot = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let max_spots = lot.read().await.max_spots;
        let current = self
            .lot_spots
            .get(&lot_id)
            .map(|e| e.value().len() as u32)
            .unwrap_or(0);
        if current + count > max_spots {
            return Err(EngineError::CapacityExceeded(max_spots));
        }

        let mut created = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let id = Ulid::new();
            let event = Event::SpotAdded { id, lot_id };
            self.wal_append(&event).await?;
            self.spots
                .insert(id, Arc::new(RwLock::new(SpotState::new(id, lot_id))));
            self.lot_spots.entry(lot_id).or_default().push(id);
            created.push(id);
        }
        info!("added {count} spots to lot {lot_id}");
        Ok(created)
    }

    /// Admin-only. Cascades to the spot's reservations.
    pub async fn delete_spot(&self, actor: &Principal, spot_id: Ulid) -> Result<(), EngineError> {
        require_admin(actor)?;
        let spot = self
            .get_spot(&spot_id)
            .ok_or(EngineError::NotFound(spot_id))?;
        let lot_id = spot.read().await.lot_id;

        let event = Event::SpotRemoved { id: spot_id, lot_id };
        self.wal_append(&event).await?;
        if let Some(mut siblings) = self.lot_spots.get_mut(&lot_id) {
            siblings.retain(|s| s != &spot_id);
        }
        self.retire_spot(&spot_id).await;
        Ok(())
    }

    /// Remove a spot's state and unmap its reservations, waiting out any
    /// in-flight booking holding the lock.
    async fn retire_spot(&self, spot_id: &Ulid) {
        if let Some((_, spot)) = self.spots.remove(spot_id) {
            let guard = spot.read().await;
            for r in &guard.reservations {
                self.reservation_to_spot.remove(&r.id);
            }
        }
    }

    // ── Reservation lifecycle ────────────────────────────────

    /// Validate → conflict-check → price → persist, all under the spot's
    /// write lock. The cached flag goes Occupied only if the window contains
    /// "now"; a future-scheduled booking leaves the spot Available.
    pub async fn create_reservation(
        &self,
        actor: &Principal,
        spot_id: Ulid,
        window: Window,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<(Ulid, f64), EngineError> {
        self.create_reservation_at(actor, spot_id, window, rating, feedback, now_ms())
            .await
    }

    /// Same as `create_reservation` with an explicit "now" — the validation
    /// instant the same-day policy is measured against.
    pub(crate) async fn create_reservation_at(
        &self,
        actor: &Principal,
        spot_id: Ulid,
        window: Window,
        rating: u8,
        feedback: Option<String>,
        now: Ms,
    ) -> Result<(Ulid, f64), EngineError> {
        validate_window(&window, now)?;
        let rating = match rating {
            0 => None,
            r if r <= MAX_RATING => Some(r),
            _ => return Err(EngineError::Validation("rating must be between 1 and 5")),
        };
        let feedback = normalize_feedback(feedback)?;

        let spot = self
            .get_spot(&spot_id)
            .ok_or(EngineError::NotFound(spot_id))?;
        let lot_id = spot.read().await.lot_id;
        let lot = self.get_lot(&lot_id).ok_or(EngineError::NotFound(lot_id))?;
        let hourly_rate = lot.read().await.price;

        let mut guard = spot.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_SPOT {
            return Err(EngineError::LimitExceeded("too many reservations on spot"));
        }
        if let Err(e) = check_no_conflict(&guard, &window) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let cost = booking_cost(hourly_rate, &window);
        let id = Ulid::new();
        let event = Event::ReservationBooked {
            id,
            spot_id,
            user_id: actor.user_id,
            window,
            cost,
            rating,
            feedback,
        };
        self.persist_and_apply(&mut guard, &event, now).await?;
        metrics::counter!(crate::observability::BOOKINGS_TOTAL).increment(1);
        info!(
            "user {} booked spot {spot_id} [{}, {}) for {cost}",
            actor.user_id, window.start, window.end
        );
        Ok((id, cost))
    }

    /// Ends the reservation at "now" and frees the spot. Rejects repeat
    /// checkouts and checkouts of cancelled reservations.
    pub async fn checkout(
        &self,
        actor: &Principal,
        reservation_id: Ulid,
    ) -> Result<Ms, EngineError> {
        self.checkout_at(actor, reservation_id, now_ms()).await
    }

    /// Same as `checkout` with an explicit "now". The recorded end is clamped
    /// to the booked end — a late checkout never widens the window, so it can
    /// never create an overlap with a back-to-back reservation.
    pub(crate) async fn checkout_at(
        &self,
        actor: &Principal,
        reservation_id: Ulid,
        now: Ms,
    ) -> Result<Ms, EngineError> {
        let (spot_id, mut guard) = self.resolve_reservation_write(&reservation_id).await?;
        let r = guard
            .reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if r.user_id != actor.user_id {
            return Err(EngineError::Unauthorized(reservation_id));
        }
        match r.state {
            ReservationState::Booked => {}
            ReservationState::CheckedOut => {
                return Err(EngineError::InvalidState("already checked out"));
            }
            ReservationState::Cancelled => {
                return Err(EngineError::InvalidState("reservation was cancelled"));
            }
        }

        let at = now.min(r.window.end);
        let event = Event::CheckedOut {
            id: reservation_id,
            spot_id,
            at,
        };
        self.persist_and_apply(&mut guard, &event, now).await?;
        Ok(at)
    }

    /// Mark-ended cancellation: the row stays with its window truncated at
    /// the cancellation instant, and the spot is freed.
    pub async fn cancel(
        &self,
        actor: &Principal,
        reservation_id: Ulid,
    ) -> Result<(), EngineError> {
        self.cancel_at(actor, reservation_id, now_ms()).await
    }

    /// Same as `cancel` with an explicit "now". Clamped like `checkout_at`.
    pub(crate) async fn cancel_at(
        &self,
        actor: &Principal,
        reservation_id: Ulid,
        now: Ms,
    ) -> Result<(), EngineError> {
        let (spot_id, mut guard) = self.resolve_reservation_write(&reservation_id).await?;
        let r = guard
            .reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if r.user_id != actor.user_id {
            return Err(EngineError::Unauthorized(reservation_id));
        }
        if r.state != ReservationState::Booked {
            return Err(EngineError::InvalidState("reservation already closed"));
        }

        let at = now.min(r.window.end);
        let event = Event::Cancelled {
            id: reservation_id,
            spot_id,
            at,
        };
        self.persist_and_apply(&mut guard, &event, now).await?;
        info!("user {} cancelled reservation {reservation_id}", actor.user_id);
        Ok(())
    }

    /// Attaches rating/feedback unconditionally — not restricted to
    /// checked-out reservations, matching the portal this replaces.
    pub async fn submit_rating(
        &self,
        actor: &Principal,
        reservation_id: Ulid,
        rating: u8,
        feedback: Option<String>,
    ) -> Result<(), EngineError> {
        if rating == 0 || rating > MAX_RATING {
            return Err(EngineError::Validation("rating must be between 1 and 5"));
        }
        let feedback = normalize_feedback(feedback)?;
        let (spot_id, mut guard) = self.resolve_reservation_write(&reservation_id).await?;
        let r = guard
            .reservation(reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if r.user_id != actor.user_id {
            return Err(EngineError::Unauthorized(reservation_id));
        }

        let event = Event::RatingSubmitted {
            id: reservation_id,
            spot_id,
            rating,
            feedback,
        };
        self.persist_and_apply(&mut guard, &event, now_ms()).await
    }

    // ── Sweep ────────────────────────────────────────────────

    /// Flip stale Occupied flags back to Available wherever the timeline no
    /// longer contains "now". Idempotent, never fails, no WAL traffic (the
    /// flag is derived state). Contended spots are skipped — an in-flight
    /// mutation will refresh them itself.
    pub fn sweep_expired(&self, now: Ms) -> usize {
        let mut released = 0usize;
        for entry in self.spots.iter() {
            let spot = entry.value().clone();
            if let Ok(mut guard) = spot.try_write()
                && guard.status == SpotStatus::Occupied
            {
                let derived = guard.derived_status(now);
                if derived == SpotStatus::Available {
                    guard.status = SpotStatus::Available;
                    released += 1;
                }
            }
        }
        if released > 0 {
            metrics::counter!(crate::observability::SPOTS_RELEASED_TOTAL)
                .increment(released as u64);
            info!("sweep released {released} stale spot flags");
        }
        released
    }

    // ── WAL compaction ───────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Runs concurrently with traffic, so every lock is awaited — an
    /// in-flight booking holding its spot's write lock just delays the
    /// snapshot of that spot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        let user_arcs: Vec<_> = self.users.iter().map(|e| e.value().clone()).collect();
        for user in user_arcs {
            let guard = user.read().await;
            events.push(Event::UserRegistered {
                id: guard.id,
                username: guard.username.clone(),
                password_hash: guard.password_hash.clone(),
                role: guard.role,
            });
        }

        let lot_ids: Vec<Ulid> = self.lots.iter().map(|e| *e.key()).collect();
        for lot_id in lot_ids {
            let Some(lot) = self.get_lot(&lot_id) else { continue };
            let guard = lot.read().await;
            events.push(Event::LotCreated {
                id: guard.id,
                name: guard.name.clone(),
                address: guard.address.clone(),
                pin_code: guard.pin_code.clone(),
                price: guard.price,
                max_spots: guard.max_spots,
            });
            drop(guard);

            for spot_id in self
                .lot_spots
                .get(&lot_id)
                .map(|e| e.value().clone())
                .unwrap_or_default()
            {
                let Some(spot) = self.get_spot(&spot_id) else { continue };
                let spot_guard = spot.read().await;
                events.push(Event::SpotAdded {
                    id: spot_id,
                    lot_id,
                });
                for r in &spot_guard.reservations {
                    events.push(Event::ReservationBooked {
                        id: r.id,
                        spot_id,
                        user_id: r.user_id,
                        window: r.window,
                        cost: r.cost.unwrap_or(0.0),
                        rating: r.rating,
                        feedback: r.feedback.clone(),
                    });
                    match r.state {
                        ReservationState::Booked => {}
                        ReservationState::CheckedOut => events.push(Event::CheckedOut {
                            id: r.id,
                            spot_id,
                            at: r.window.end,
                        }),
                        ReservationState::Cancelled => events.push(Event::Cancelled {
                            id: r.id,
                            spot_id,
                            at: r.window.end,
                        }),
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
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

fn validate_lot_fields(
    name: &str,
    address: &str,
    pin_code: &str,
    price: f64,
) -> Result<(), EngineError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("lot name length out of range"));
    }
    if address.len() > MAX_ADDRESS_LEN {
        return Err(EngineError::LimitExceeded("address too long"));
    }
    if pin_code.len() > MAX_PIN_CODE_LEN {
        return Err(EngineError::LimitExceeded("pin code too long"));
    }
    if !price.is_finite() || price < 0.0 {
        return Err(EngineError::Validation("hourly rate must be non-negative"));
    }
    Ok(())
}
