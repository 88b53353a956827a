use std::path::PathBuf;

use ulid::Ulid;

use crate::auth::Principal;
use crate::model::*;

use super::pricing::{billable_hours, booking_cost};
use super::{Engine, EngineError};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("parkd_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn admin() -> Principal {
    Principal {
        user_id: Ulid::new(),
        role: Role::Admin,
    }
}

fn user() -> Principal {
    Principal {
        user_id: Ulid::new(),
        role: Role::User,
    }
}

/// Fixed mid-day instant so same-day windows never straddle midnight.
fn fake_noon() -> Ms {
    let base: Ms = 1_900_000_000_000;
    base - base % MS_PER_DAY + 12 * MS_PER_HOUR
}

/// One lot at the given hourly rate with one spot.
async fn lot_with_spot(engine: &Engine, actor: &Principal, rate: f64) -> (Ulid, Ulid) {
    let lot = engine
        .create_lot(actor, "Central".into(), "1 Main St".into(), "560001".into(), rate, 10)
        .await
        .unwrap();
    let spots = engine.add_spots(actor, lot, 1).await.unwrap();
    (lot, spots[0])
}

// ── Pricing ──────────────────────────────────────────────

#[test]
fn partial_hours_round_up() {
    let w = Window::new(0, 61 * 60_000);
    assert_eq!(billable_hours(&w), 2);
    assert_eq!(booking_cost(10.0, &w), 20.0);
}

#[test]
fn exact_hours_do_not_round_up() {
    let w = Window::new(0, 60 * 60_000);
    assert_eq!(billable_hours(&w), 1);
    assert_eq!(booking_cost(10.0, &w), 10.0);
}

#[test]
fn sub_hour_bills_one_hour() {
    let w = Window::new(0, 60_000);
    assert_eq!(billable_hours(&w), 1);
}

// ── Window validation ────────────────────────────────────

#[tokio::test]
async fn booking_rejects_past_start() {
    let engine = Engine::new(test_wal_path("past_start.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now - MS_PER_HOUR, now + MS_PER_HOUR);
    let err = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "got {err}");
}

#[tokio::test]
async fn booking_rejects_inverted_window() {
    let engine = Engine::new(test_wal_path("inverted.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window { start: now + 2 * MS_PER_HOUR, end: now + MS_PER_HOUR };
    let err = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let empty = Window { start: now + MS_PER_HOUR, end: now + MS_PER_HOUR };
    let err = engine
        .create_reservation_at(&actor, spot, empty, 0, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "zero-length window");
}

#[tokio::test]
async fn booking_rejects_other_days() {
    let engine = Engine::new(test_wal_path("other_day.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    // Starts today, ends tomorrow.
    let window = Window::new(now + MS_PER_HOUR, now + 13 * MS_PER_HOUR);
    let err = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Entirely tomorrow.
    let window = Window::new(now + MS_PER_DAY, now + MS_PER_DAY + MS_PER_HOUR);
    let err = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn booking_rejects_out_of_range_timestamps() {
    let engine = Engine::new(test_wal_path("ts_range.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let window = Window { start: -5, end: 5 };
    let err = engine
        .create_reservation_at(&actor, spot, window, 0, None, fake_noon())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

// ── Conflict detection ───────────────────────────────────

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let engine = Engine::new(test_wal_path("overlap.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 50.0).await;

    let now = fake_noon();
    // First booking noon..13:30, rate 50 → 2 billable hours → 100.
    let first = Window::new(now, now + 90 * 60_000);
    let (first_id, cost) = engine
        .create_reservation_at(&actor, spot, first, 0, None, now)
        .await
        .unwrap();
    assert_eq!(cost, 100.0);

    // 13:00..14:00 overlaps the tail.
    let second = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
    let err = engine
        .create_reservation_at(&actor, spot, second, 0, None, now)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Conflict(first_id));
}

#[tokio::test]
async fn back_to_back_bookings_share_a_boundary() {
    let engine = Engine::new(test_wal_path("boundary.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let first = Window::new(now, now + MS_PER_HOUR);
    engine
        .create_reservation_at(&actor, spot, first, 0, None, now)
        .await
        .unwrap();

    // [12:00, 13:00) then [13:00, 14:00): the boundary instant belongs to
    // the second booking only.
    let second = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
    engine
        .create_reservation_at(&actor, spot, second, 0, None, now)
        .await
        .unwrap();
}

#[tokio::test]
async fn checkout_truncates_the_window() {
    let engine = Engine::new(test_wal_path("closed_blocks.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now, now + 2 * MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    // Checkout truncates the window at the checkout instant.
    let at = engine.checkout(&actor, id).await.unwrap();
    let spot_state = engine.get_spot(&spot).unwrap();
    let truncated_end = spot_state.read().await.reservation(id).unwrap().window.end;
    assert_eq!(truncated_end, at);
}

#[tokio::test]
async fn concurrent_overlapping_bookings_one_wins() {
    let engine = std::sync::Arc::new(Engine::new(test_wal_path("race.wal")).unwrap());
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let a = Window::new(now, now + MS_PER_HOUR);
    let b = Window::new(now + 30 * 60_000, now + 2 * MS_PER_HOUR);

    let (ra, rb) = tokio::join!(
        engine.create_reservation_at(&actor, spot, a, 0, None, now),
        engine.create_reservation_at(&actor, spot, b, 0, None, now),
    );
    assert!(
        ra.is_ok() != rb.is_ok(),
        "exactly one of two overlapping bookings must win: {ra:?} / {rb:?}"
    );
    let loser = if ra.is_err() { ra } else { rb };
    assert!(matches!(loser.unwrap_err(), EngineError::Conflict(_)));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn checkout_is_not_repeatable() {
    let engine = Engine::new(test_wal_path("double_checkout.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now, now + MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    engine.checkout(&actor, id).await.unwrap();
    let err = engine.checkout(&actor, id).await.unwrap_err();
    assert_eq!(err, EngineError::InvalidState("already checked out"));

    let spot_state = engine.get_spot(&spot).unwrap();
    let guard = spot_state.read().await;
    assert_eq!(
        guard.reservation(id).unwrap().state,
        ReservationState::CheckedOut,
        "failed second checkout must not disturb the record"
    );
}

#[tokio::test]
async fn cancelled_reservation_cannot_be_checked_out() {
    let engine = Engine::new(test_wal_path("cancel_then_checkout.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    engine.cancel(&actor, id).await.unwrap();
    let err = engine.checkout(&actor, id).await.unwrap_err();
    assert_eq!(err, EngineError::InvalidState("reservation was cancelled"));

    let err = engine.cancel(&actor, id).await.unwrap_err();
    assert_eq!(err, EngineError::InvalidState("reservation already closed"));
}

#[tokio::test]
async fn cancel_before_start_frees_the_window() {
    let engine = Engine::new(test_wal_path("cancel_rebook.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now + 3 * MS_PER_HOUR, now + 4 * MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();
    engine.cancel(&actor, id).await.unwrap();

    // The cancelled row's window collapsed to nothing, so the same window
    // books again.
    engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();
}

#[tokio::test]
async fn lifecycle_rejects_non_owner() {
    let engine = Engine::new(test_wal_path("non_owner.wal")).unwrap();
    let owner = admin();
    let stranger = user();
    let (_, spot) = lot_with_spot(&engine, &owner, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now, now + MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&owner, spot, window, 0, None, now)
        .await
        .unwrap();

    assert_eq!(
        engine.cancel(&stranger, id).await.unwrap_err(),
        EngineError::Unauthorized(id)
    );
    assert_eq!(
        engine.checkout(&stranger, id).await.unwrap_err(),
        EngineError::Unauthorized(id)
    );
    assert_eq!(
        engine.submit_rating(&stranger, id, 5, None).await.unwrap_err(),
        EngineError::Unauthorized(id)
    );

    let spot_state = engine.get_spot(&spot).unwrap();
    let guard = spot_state.read().await;
    let r = guard.reservation(id).unwrap();
    assert_eq!(r.state, ReservationState::Booked);
    assert_eq!(r.window, window, "rejected calls must not mutate the record");
}

#[tokio::test]
async fn ratings_validate_and_attach() {
    let engine = Engine::new(test_wal_path("ratings.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now, now + MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    for bad in [0u8, 6, 200] {
        let err = engine.submit_rating(&actor, id, bad, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "rating {bad}");
    }

    engine
        .submit_rating(&actor, id, 4, Some("  tight spot  ".into()))
        .await
        .unwrap();
    let spot_state = engine.get_spot(&spot).unwrap();
    let guard = spot_state.read().await;
    let r = guard.reservation(id).unwrap();
    assert_eq!(r.rating, Some(4));
    assert_eq!(r.feedback.as_deref(), Some("tight spot"));
}

#[tokio::test]
async fn rating_at_booking_time_is_validated() {
    let engine = Engine::new(test_wal_path("rating_at_book.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now, now + MS_PER_HOUR);
    let err = engine
        .create_reservation_at(&actor, spot, window, 9, None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 3, Some("ok".into()), now)
        .await
        .unwrap();
    let spot_state = engine.get_spot(&spot).unwrap();
    assert_eq!(spot_state.read().await.reservation(id).unwrap().rating, Some(3));
}

// ── Derived occupancy ────────────────────────────────────

#[tokio::test]
async fn occupancy_follows_the_window() {
    let engine = Engine::new(test_wal_path("occupancy.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now, now + MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    let spot_state = engine.get_spot(&spot).unwrap();
    assert_eq!(
        spot_state.read().await.status,
        SpotStatus::Occupied,
        "window contains the booking instant"
    );

    engine.checkout(&actor, id).await.unwrap();
    assert_eq!(spot_state.read().await.status, SpotStatus::Available);
}

#[tokio::test]
async fn future_booking_leaves_spot_available() {
    let engine = Engine::new(test_wal_path("future_booking.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now + 5 * MS_PER_HOUR, now + 6 * MS_PER_HOUR);
    engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    let spot_state = engine.get_spot(&spot).unwrap();
    assert_eq!(spot_state.read().await.status, SpotStatus::Available);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let actor = admin();
    let now = fake_noon();
    let (lot, spot, id) = {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .register_user("alice", "hash".into(), Role::User)
            .await
            .unwrap();
        let (lot, spot) = lot_with_spot(&engine, &actor, 50.0).await;
        let window = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
        let (id, _) = engine
            .create_reservation_at(&actor, spot, window, 0, None, now)
            .await
            .unwrap();
        (lot, spot, id)
    };

    let engine = Engine::new(path).unwrap();
    assert!(engine.find_user("alice").is_some());
    let lot_state = engine.get_lot(&lot).unwrap();
    assert_eq!(lot_state.read().await.price, 50.0);
    let spot_state = engine.get_spot(&spot).unwrap();
    let guard = spot_state.read().await;
    let r = guard.reservation(id).unwrap();
    assert_eq!(r.state, ReservationState::Booked);
    assert_eq!(r.cost, Some(50.0));
    assert_eq!(engine.spot_for_reservation(&id), Some(spot));
}

#[tokio::test]
async fn replay_survives_lifecycle_events() {
    let path = test_wal_path("replay_lifecycle.wal");
    let actor = admin();
    let now = fake_noon();
    let (spot, cancelled, rated) = {
        let engine = Engine::new(path.clone()).unwrap();
        let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;
        let w1 = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
        let (cancelled, _) = engine
            .create_reservation_at(&actor, spot, w1, 0, None, now)
            .await
            .unwrap();
        engine.cancel(&actor, cancelled).await.unwrap();
        let w2 = Window::new(now + 3 * MS_PER_HOUR, now + 4 * MS_PER_HOUR);
        let (rated, _) = engine
            .create_reservation_at(&actor, spot, w2, 0, None, now)
            .await
            .unwrap();
        engine.submit_rating(&actor, rated, 5, Some("fine".into())).await.unwrap();
        (spot, cancelled, rated)
    };

    let engine = Engine::new(path).unwrap();
    let spot_state = engine.get_spot(&spot).unwrap();
    let guard = spot_state.read().await;
    assert_eq!(
        guard.reservation(cancelled).unwrap().state,
        ReservationState::Cancelled
    );
    let r = guard.reservation(rated).unwrap();
    assert_eq!(r.rating, Some(5));
    assert_eq!(r.feedback.as_deref(), Some("fine"));
}

// ── Capability checks ────────────────────────────────────

#[tokio::test]
async fn admin_operations_reject_regular_users() {
    let engine = Engine::new(test_wal_path("admin_gate.wal")).unwrap();
    let boss = admin();
    let pleb = user();
    let (lot, spot) = lot_with_spot(&engine, &boss, 10.0).await;

    let err = engine
        .create_lot(&pleb, "X".into(), "Y".into(), "1".into(), 5.0, 1)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AdminRequired);
    assert_eq!(
        engine.add_spots(&pleb, lot, 1).await.unwrap_err(),
        EngineError::AdminRequired
    );
    assert_eq!(
        engine.delete_spot(&pleb, spot).await.unwrap_err(),
        EngineError::AdminRequired
    );
    assert_eq!(
        engine.delete_lot(&pleb, lot).await.unwrap_err(),
        EngineError::AdminRequired
    );
    assert_eq!(
        engine
            .update_lot(&pleb, lot, "X".into(), "Y".into(), "1".into(), 5.0)
            .await
            .unwrap_err(),
        EngineError::AdminRequired
    );
    assert_eq!(
        engine.delete_user(&pleb, pleb.user_id).await.unwrap_err(),
        EngineError::AdminRequired
    );
}

#[tokio::test]
async fn late_checkout_does_not_extend_the_window() {
    let engine = Engine::new(test_wal_path("late_checkout.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let first = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
    let (first_id, _) = engine
        .create_reservation_at(&actor, spot, first, 0, None, now)
        .await
        .unwrap();
    let second = Window::new(now + 2 * MS_PER_HOUR, now + 3 * MS_PER_HOUR);
    engine
        .create_reservation_at(&actor, spot, second, 0, None, now)
        .await
        .unwrap();

    // Checking out half an hour after the booked end clamps to the booked
    // end — the back-to-back neighbour stays overlap-free.
    let at = engine
        .checkout_at(&actor, first_id, now + 2 * MS_PER_HOUR + 30 * 60_000)
        .await
        .unwrap();
    assert_eq!(at, first.end);
    let spot_state = engine.get_spot(&spot).unwrap();
    let guard = spot_state.read().await;
    assert_eq!(guard.reservation(first_id).unwrap().window.end, first.end);
    let windows: Vec<Window> = guard
        .reservations
        .iter()
        .map(|r| r.window)
        .filter(|w| !w.is_degenerate())
        .collect();
    assert!(!windows[0].overlaps(&windows[1]));
}

#[tokio::test]
async fn late_cancel_does_not_extend_the_window() {
    let engine = Engine::new(test_wal_path("late_cancel.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    engine
        .cancel_at(&actor, id, now + 5 * MS_PER_HOUR)
        .await
        .unwrap();
    let spot_state = engine.get_spot(&spot).unwrap();
    assert_eq!(
        spot_state.read().await.reservation(id).unwrap().window.end,
        window.end
    );
}

#[tokio::test]
async fn usernames_are_unique() {
    let engine = Engine::new(test_wal_path("usernames.wal")).unwrap();
    engine
        .register_user("bob", "h1".into(), Role::User)
        .await
        .unwrap();
    let err = engine
        .register_user("bob", "h2".into(), Role::User)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::UsernameTaken("bob".into()));
}

#[tokio::test]
async fn concurrent_registrations_one_wins() {
    let engine = Engine::new(test_wal_path("register_race.wal")).unwrap();

    // The name is claimed before the WAL write yields, so two interleaved
    // registrations can never both commit.
    let (a, b) = tokio::join!(
        engine.register_user("mallory", "h1".into(), Role::User),
        engine.register_user("mallory", "h2".into(), Role::User),
    );
    assert!(
        a.is_ok() != b.is_ok(),
        "exactly one registration must win: {a:?} / {b:?}"
    );
    let loser = if a.is_err() { a } else { b };
    assert!(matches!(loser.unwrap_err(), EngineError::UsernameTaken(_)));

    let winner_id = engine.find_user("mallory").unwrap().read().await.id;
    assert_eq!(engine.usernames.get("mallory").map(|e| *e.value()), Some(winner_id));
    assert_eq!(engine.users.len(), 1);
}

#[tokio::test]
async fn compaction_waits_out_in_flight_writers() {
    let engine = std::sync::Arc::new(Engine::new(test_wal_path("compact_contended.wal")).unwrap());
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;
    let now = fake_noon();
    engine
        .create_reservation_at(&actor, spot, Window::new(now, now + MS_PER_HOUR), 0, None, now)
        .await
        .unwrap();

    // Simulate a booking in flight: hold the spot's write lock while the
    // compactor runs. It must park on the lock, not die.
    let guard = engine.get_spot(&spot).unwrap().write_owned().await;
    let compactor = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.compact_wal().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!compactor.is_finished());

    drop(guard);
    compactor.await.unwrap().unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn add_spots_respects_lot_capacity() {
    let engine = Engine::new(test_wal_path("capacity.wal")).unwrap();
    let actor = admin();
    let lot = engine
        .create_lot(&actor, "Tiny".into(), "A".into(), "1".into(), 5.0, 3)
        .await
        .unwrap();
    engine.add_spots(&actor, lot, 2).await.unwrap();
    let err = engine.add_spots(&actor, lot, 2).await.unwrap_err();
    assert_eq!(err, EngineError::CapacityExceeded(3));
    engine.add_spots(&actor, lot, 1).await.unwrap();
}

// ── Cascading deletes ────────────────────────────────────

#[tokio::test]
async fn delete_lot_cascades_to_spots_and_reservations() {
    let engine = Engine::new(test_wal_path("cascade_lot.wal")).unwrap();
    let actor = admin();
    let (lot, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let window = Window::new(now, now + MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&actor, spot, window, 0, None, now)
        .await
        .unwrap();

    engine.delete_lot(&actor, lot).await.unwrap();
    assert!(engine.get_lot(&lot).is_none());
    assert!(engine.get_spot(&spot).is_none());
    assert!(engine.spot_for_reservation(&id).is_none());
    assert_eq!(
        engine.cancel(&actor, id).await.unwrap_err(),
        EngineError::NotFound(id)
    );
}

#[tokio::test]
async fn delete_user_removes_their_reservations() {
    let engine = Engine::new(test_wal_path("cascade_user.wal")).unwrap();
    let boss = admin();
    let (_, spot) = lot_with_spot(&engine, &boss, 10.0).await;
    let uid = engine
        .register_user("carol", "h".into(), Role::User)
        .await
        .unwrap();
    let carol = Principal {
        user_id: uid,
        role: Role::User,
    };

    let now = fake_noon();
    let window = Window::new(now, now + MS_PER_HOUR);
    let (id, _) = engine
        .create_reservation_at(&carol, spot, window, 0, None, now)
        .await
        .unwrap();

    engine.delete_user(&boss, uid).await.unwrap();
    assert!(engine.find_user("carol").is_none());
    assert!(engine.spot_for_reservation(&id).is_none());
    let spot_state = engine.get_spot(&spot).unwrap();
    assert!(spot_state.read().await.reservations.is_empty());
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn active_and_history_split_by_state_and_time() {
    let engine = Engine::new(test_wal_path("active_history.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;

    let now = fake_noon();
    let w1 = Window::new(now, now + MS_PER_HOUR);
    let (done, _) = engine
        .create_reservation_at(&actor, spot, w1, 0, None, now)
        .await
        .unwrap();
    engine.checkout(&actor, done).await.unwrap();

    let w2 = Window::new(now + 2 * MS_PER_HOUR, now + 3 * MS_PER_HOUR);
    let (upcoming, _) = engine
        .create_reservation_at(&actor, spot, w2, 0, None, now)
        .await
        .unwrap();

    let active = engine.active_bookings_for(actor.user_id, now).await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, upcoming);

    let history = engine.booking_history(actor.user_id).await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, upcoming, "newest first");
    assert_eq!(history[1].id, done);
}

#[tokio::test]
async fn total_spent_sums_all_costs() {
    let engine = Engine::new(test_wal_path("total_spent.wal")).unwrap();
    let actor = admin();
    let (_, spot) = lot_with_spot(&engine, &actor, 20.0).await;

    let now = fake_noon();
    engine
        .create_reservation_at(&actor, spot, Window::new(now, now + MS_PER_HOUR), 0, None, now)
        .await
        .unwrap();
    engine
        .create_reservation_at(
            &actor,
            spot,
            Window::new(now + MS_PER_HOUR, now + 150 * 60_000),
            0,
            None,
            now,
        )
        .await
        .unwrap();
    // 1h at 20 plus 1.5h (billed as 2) at 20.
    assert_eq!(engine.total_spent(actor.user_id).await, 60.0);
    assert_eq!(engine.total_spent(Ulid::new()).await, 0.0);
}

#[tokio::test]
async fn search_lots_matches_and_counts_availability() {
    let engine = Engine::new(test_wal_path("search.wal")).unwrap();
    let actor = admin();
    let lot_a = engine
        .create_lot(&actor, "Airport North".into(), "Terminal Rd".into(), "560017".into(), 30.0, 5)
        .await
        .unwrap();
    let spots_a = engine.add_spots(&actor, lot_a, 2).await.unwrap();
    engine
        .create_lot(&actor, "Downtown".into(), "Market Sq".into(), "560001".into(), 15.0, 5)
        .await
        .unwrap();

    let all = engine.search_lots("", None).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].name, "Airport North", "sorted by name");

    let by_name = engine.search_lots("airport", None).await;
    assert_eq!(by_name.len(), 1);
    let by_pin = engine.search_lots("560001", None).await;
    assert_eq!(by_pin.len(), 1);
    assert_eq!(by_pin[0].name, "Downtown");

    // Book one airport spot for the probed window; availability drops to 1.
    let now = fake_noon();
    let window = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
    engine
        .create_reservation_at(&actor, spots_a[0], window, 0, None, now)
        .await
        .unwrap();
    let probed = engine.search_lots("airport", Some(window)).await;
    assert_eq!(probed[0].total_spots, 2);
    assert_eq!(probed[0].available_spots, 1);

    // A disjoint window sees both spots free.
    let later = Window::new(now + 3 * MS_PER_HOUR, now + 4 * MS_PER_HOUR);
    let probed = engine.search_lots("airport", Some(later)).await;
    assert_eq!(probed[0].available_spots, 2);
}

#[tokio::test]
async fn available_spots_filters_by_window() {
    let engine = Engine::new(test_wal_path("avail_spots.wal")).unwrap();
    let actor = admin();
    let lot = engine
        .create_lot(&actor, "L".into(), "A".into(), "1".into(), 10.0, 4)
        .await
        .unwrap();
    let spots = engine.add_spots(&actor, lot, 3).await.unwrap();

    let now = fake_noon();
    let window = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
    engine
        .create_reservation_at(&actor, spots[1], window, 0, None, now)
        .await
        .unwrap();

    let free = engine.available_spots(lot, Some(window)).await.unwrap();
    assert_eq!(free.len(), 2);
    assert!(free.iter().all(|s| s.id != spots[1]));

    let err = engine.available_spots(Ulid::new(), None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

#[tokio::test]
async fn dashboard_stats_aggregate() {
    let engine = Engine::new(test_wal_path("stats.wal")).unwrap();
    let actor = admin();
    engine
        .register_user("dave", "h".into(), Role::User)
        .await
        .unwrap();
    let (_, spot) = lot_with_spot(&engine, &actor, 25.0).await;

    let now = fake_noon();
    engine
        .create_reservation_at(&actor, spot, Window::new(now, now + MS_PER_HOUR), 0, None, now)
        .await
        .unwrap();

    let stats = engine.dashboard_stats().await;
    assert_eq!(stats.lots, 1);
    assert_eq!(stats.users, 1);
    assert_eq!(stats.total_spots, 1);
    assert_eq!(stats.occupied_spots, 1);
    assert_eq!(stats.total_revenue, 25.0);
}

#[tokio::test]
async fn recent_feeds_split_portal_wide_and_per_user() {
    let engine = Engine::new(test_wal_path("recent_feeds.wal")).unwrap();
    let boss = admin();
    let other = user();
    let lot = engine
        .create_lot(&boss, "L".into(), "A".into(), "1".into(), 10.0, 4)
        .await
        .unwrap();
    let spots = engine.add_spots(&boss, lot, 2).await.unwrap();

    let now = fake_noon();
    engine
        .create_reservation_at(&boss, spots[0], Window::new(now, now + MS_PER_HOUR), 0, None, now)
        .await
        .unwrap();
    let late = Window::new(now + 2 * MS_PER_HOUR, now + 3 * MS_PER_HOUR);
    let (theirs, _) = engine
        .create_reservation_at(&other, spots[1], late, 0, None, now)
        .await
        .unwrap();

    assert_eq!(engine.recent_bookings(10).await.len(), 2);
    assert_eq!(engine.recent_bookings(1).await.len(), 1);

    let mine = engine.recent_bookings_for(other.user_id, 10).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, theirs);
    assert!(engine.recent_bookings_for(Ulid::new(), 10).await.is_empty());
}

// ── Compaction ───────────────────────────────────────────

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let actor = admin();
    let now = fake_noon();
    let (spot, id) = {
        let engine = Engine::new(path.clone()).unwrap();
        engine
            .register_user("erin", "h".into(), Role::Admin)
            .await
            .unwrap();
        let (_, spot) = lot_with_spot(&engine, &actor, 10.0).await;
        let window = Window::new(now + MS_PER_HOUR, now + 2 * MS_PER_HOUR);
        let (id, _) = engine
            .create_reservation_at(&actor, spot, window, 4, Some("good".into()), now)
            .await
            .unwrap();
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (spot, id)
    };

    let engine = Engine::new(path).unwrap();
    assert!(engine.find_user("erin").is_some());
    let spot_state = engine.get_spot(&spot).unwrap();
    let guard = spot_state.read().await;
    let r = guard.reservation(id).unwrap();
    assert_eq!(r.cost, Some(10.0));
    assert_eq!(r.rating, Some(4));
}
