mod booking;
mod error;
mod mutations;
mod pricing;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use booking::now_ms;

pub type SharedSpotState = Arc<RwLock<SpotState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking engine. Lots, spots, and users live in dashmaps; each spot's
/// reservation timeline sits behind its own RwLock, so the conflict check and
/// the WAL-backed insert happen under one exclusive lock — two overlapping
/// booking requests for the same spot cannot interleave.
pub struct Engine {
    pub(super) lots: DashMap<Ulid, Arc<RwLock<LotState>>>,
    pub(super) spots: DashMap<Ulid, SharedSpotState>,
    pub(super) users: DashMap<Ulid, Arc<RwLock<UserState>>>,
    /// Unique-username index.
    pub(super) usernames: DashMap<String, Ulid>,
    /// Reverse lookup: reservation id → spot id.
    pub(super) reservation_to_spot: DashMap<Ulid, Ulid>,
    /// Lot → spots index for O(1) listing.
    pub(super) lot_spots: DashMap<Ulid, Vec<Ulid>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

/// Apply a reservation-scoped event to a SpotState (no locking — caller holds
/// the lock). Cached status is refreshed separately by the caller.
fn apply_to_spot(spot: &mut SpotState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationBooked {
            id,
            spot_id,
            user_id,
            window,
            cost,
            rating,
            feedback,
        } => {
            spot.insert_reservation(Reservation {
                id: *id,
                spot_id: *spot_id,
                user_id: *user_id,
                window: *window,
                cost: Some(*cost),
                rating: *rating,
                feedback: feedback.clone(),
                state: ReservationState::Booked,
            });
            index.insert(*id, *spot_id);
        }
        Event::CheckedOut { id, at, .. } => {
            if let Some(r) = spot.reservation_mut(*id) {
                r.window.end = *at;
                r.state = ReservationState::CheckedOut;
            }
        }
        Event::Cancelled { id, at, .. } => {
            // Mark-ended policy: the row stays, its occupied window is
            // truncated at the cancellation instant.
            if let Some(r) = spot.reservation_mut(*id) {
                r.window.end = *at;
                r.state = ReservationState::Cancelled;
            }
        }
        Event::RatingSubmitted {
            id,
            rating,
            feedback,
            ..
        } => {
            if let Some(r) = spot.reservation_mut(*id) {
                r.rating = Some(*rating);
                r.feedback = feedback.clone();
            }
        }
        // Structural events are handled at the dashmap level, not here.
        _ => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            lots: DashMap::new(),
            spots: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            reservation_to_spot: DashMap::new(),
            lot_spots: DashMap::new(),
            wal_tx,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may
        // run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }

        // Cached flags are not logged; derive them from the timelines.
        let now = now_ms();
        for entry in engine.spots.iter() {
            let mut guard = entry.value().try_write().expect("replay: uncontended write");
            guard.status = guard.derived_status(now);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserRegistered {
                id,
                username,
                password_hash,
                role,
            } => {
                self.usernames.insert(username.clone(), *id);
                self.users.insert(
                    *id,
                    Arc::new(RwLock::new(UserState {
                        id: *id,
                        username: username.clone(),
                        password_hash: password_hash.clone(),
                        role: *role,
                    })),
                );
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    let guard = user.try_read().expect("replay: uncontended read");
                    self.usernames.remove(&guard.username);
                }
                for entry in self.spots.iter() {
                    let mut guard = entry.value().try_write().expect("replay: uncontended write");
                    guard.reservations.retain(|r| {
                        let keep = r.user_id != *id;
                        if !keep {
                            self.reservation_to_spot.remove(&r.id);
                        }
                        keep
                    });
                }
            }
            Event::LotCreated {
                id,
                name,
                address,
                pin_code,
                price,
                max_spots,
            } => {
                self.lots.insert(
                    *id,
                    Arc::new(RwLock::new(LotState {
                        id: *id,
                        name: name.clone(),
                        address: address.clone(),
                        pin_code: pin_code.clone(),
                        price: *price,
                        max_spots: *max_spots,
                    })),
                );
                self.lot_spots.entry(*id).or_default();
            }
            Event::LotUpdated {
                id,
                name,
                address,
                pin_code,
                price,
            } => {
                if let Some(lot) = self.lots.get(id) {
                    let mut guard = lot.try_write().expect("replay: uncontended write");
                    guard.name = name.clone();
                    guard.address = address.clone();
                    guard.pin_code = pin_code.clone();
                    guard.price = *price;
                }
            }
            Event::LotDeleted { id } => {
                if let Some((_, spot_ids)) = self.lot_spots.remove(id) {
                    for sid in spot_ids {
                        self.drop_spot_state(&sid);
                    }
                }
                self.lots.remove(id);
            }
            Event::SpotAdded { id, lot_id } => {
                self.spots
                    .insert(*id, Arc::new(RwLock::new(SpotState::new(*id, *lot_id))));
                self.lot_spots.entry(*lot_id).or_default().push(*id);
            }
            Event::SpotRemoved { id, lot_id } => {
                if let Some(mut siblings) = self.lot_spots.get_mut(lot_id) {
                    siblings.retain(|s| s != id);
                }
                self.drop_spot_state(id);
            }
            other => {
                if let Some(spot_id) = event_spot_id(other)
                    && let Some(entry) = self.spots.get(&spot_id)
                {
                    let spot_arc = entry.value().clone();
                    let mut guard = spot_arc.try_write().expect("replay: uncontended write");
                    apply_to_spot(&mut guard, other, &self.reservation_to_spot);
                }
            }
        }
    }

    /// Remove a spot's state and unmap its reservations. Callers maintain the
    /// lot_spots index themselves.
    pub(super) fn drop_spot_state(&self, spot_id: &Ulid) {
        if let Some((_, spot)) = self.spots.remove(spot_id) {
            let guard = spot.try_read().expect("spot removal: uncontended read");
            for r in &guard.reservations {
                self.reservation_to_spot.remove(&r.id);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub fn get_spot(&self, id: &Ulid) -> Option<SharedSpotState> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    pub fn get_lot(&self, id: &Ulid) -> Option<Arc<RwLock<LotState>>> {
        self.lots.get(id).map(|e| e.value().clone())
    }

    pub fn get_user(&self, id: &Ulid) -> Option<Arc<RwLock<UserState>>> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn spot_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_spot
            .get(reservation_id)
            .map(|e| *e.value())
    }

    /// WAL-append + apply + cached-status refresh in one call. WAL failure
    /// leaves the spot untouched, so either both the reservation write and
    /// the status write land or neither does.
    pub(super) async fn persist_and_apply(
        &self,
        spot: &mut SpotState,
        event: &Event,
        now: Ms,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_spot(spot, event, &self.reservation_to_spot);
        spot.status = spot.derived_status(now);
        Ok(())
    }

    /// Lookup reservation → spot, acquire the spot's write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<SpotState>), EngineError> {
        let spot_id = self
            .spot_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let spot = self
            .get_spot(&spot_id)
            .ok_or(EngineError::NotFound(spot_id))?;
        let guard = spot.write_owned().await;
        Ok((spot_id, guard))
    }
}

/// Extract the spot id from a reservation-scoped event.
fn event_spot_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationBooked { spot_id, .. }
        | Event::CheckedOut { spot_id, .. }
        | Event::Cancelled { spot_id, .. }
        | Event::RatingSubmitted { spot_id, .. } => Some(*spot_id),
        _ => None,
    }
}
