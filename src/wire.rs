//! Line-delimited JSON protocol. One request per line, one response per
//! line; no business logic — parse, authenticate, dispatch to the engine,
//! serialize. A connection has no capabilities until register/login binds a
//! principal to it.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::auth::{self, Principal};
use crate::engine::{Engine, EngineError};
use crate::model::*;

const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Register {
        username: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    CreateLot {
        name: String,
        address: String,
        pin_code: String,
        price: f64,
        max_spots: u32,
    },
    UpdateLot {
        lot_id: Ulid,
        name: String,
        address: String,
        pin_code: String,
        price: f64,
    },
    DeleteLot {
        lot_id: Ulid,
    },
    AddSpots {
        lot_id: Ulid,
        count: u32,
    },
    DeleteSpot {
        spot_id: Ulid,
    },
    DeleteUser {
        user_id: Ulid,
    },
    Book {
        spot_id: Ulid,
        start: Ms,
        end: Ms,
        #[serde(default)]
        rating: u8,
        #[serde(default)]
        feedback: Option<String>,
    },
    Checkout {
        reservation_id: Ulid,
    },
    Cancel {
        reservation_id: Ulid,
    },
    Rate {
        reservation_id: Ulid,
        rating: u8,
        #[serde(default)]
        feedback: Option<String>,
    },
    MyBookings,
    History,
    TotalSpent,
    SearchLots {
        #[serde(default)]
        query: String,
        #[serde(default)]
        start: Option<Ms>,
        #[serde(default)]
        end: Option<Ms>,
    },
    AvailableSpots {
        lot_id: Ulid,
        #[serde(default)]
        start: Option<Ms>,
        #[serde(default)]
        end: Option<Ms>,
    },
    LotSpots {
        lot_id: Ulid,
    },
    Stats,
    Recent {
        #[serde(default = "default_recent_limit")]
        limit: usize,
    },
    Sweep,
}

fn default_recent_limit() -> usize {
    5
}

/// Short label for per-op metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::Register { .. } => "register",
        Request::Login { .. } => "login",
        Request::CreateLot { .. } => "create_lot",
        Request::UpdateLot { .. } => "update_lot",
        Request::DeleteLot { .. } => "delete_lot",
        Request::AddSpots { .. } => "add_spots",
        Request::DeleteSpot { .. } => "delete_spot",
        Request::DeleteUser { .. } => "delete_user",
        Request::Book { .. } => "book",
        Request::Checkout { .. } => "checkout",
        Request::Cancel { .. } => "cancel",
        Request::Rate { .. } => "rate",
        Request::MyBookings => "my_bookings",
        Request::History => "history",
        Request::TotalSpent => "total_spent",
        Request::SearchLots { .. } => "search_lots",
        Request::AvailableSpots { .. } => "available_spots",
        Request::LotSpots { .. } => "lot_spots",
        Request::Stats => "stats",
        Request::Recent { .. } => "recent",
        Request::Sweep => "sweep",
    }
}

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

fn engine_err(e: EngineError) -> Value {
    json!({ "ok": false, "kind": e.kind(), "error": e.to_string() })
}

fn protocol_err(kind: &str, message: &str) -> Value {
    json!({ "ok": false, "kind": kind, "error": message })
}

/// Build the `[start, end)` window from optional request fields. Untrusted
/// input, so the struct is built literally — policy checks happen in the
/// validator, not here.
fn optional_window(start: Option<Ms>, end: Option<Ms>) -> Result<Option<Window>, Value> {
    match (start, end) {
        (Some(start), Some(end)) if start < end => Ok(Some(Window { start, end })),
        (Some(_), Some(_)) => Err(protocol_err("validation", "end time must be after start time")),
        (None, None) => Ok(None),
        _ => Err(protocol_err("validation", "start and end must be given together")),
    }
}

pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut session: Option<Principal> = None;

    while let Some(line) = framed.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => {
                let op = op_label(&request);
                let started = std::time::Instant::now();
                let response = dispatch(&engine, &mut session, request).await;
                let status = if response["ok"].as_bool().unwrap_or(false) {
                    "ok"
                } else {
                    "error"
                };
                metrics::counter!(
                    crate::observability::REQUESTS_TOTAL,
                    "op" => op, "status" => status
                )
                .increment(1);
                metrics::histogram!(
                    crate::observability::REQUEST_DURATION_SECONDS,
                    "op" => op
                )
                .record(started.elapsed().as_secs_f64());
                debug!("{op}: {status}");
                response
            }
            Err(e) => protocol_err("bad_request", &format!("malformed request: {e}")),
        };
        framed.send(response.to_string()).await?;
    }
    Ok(())
}

async fn dispatch(engine: &Engine, session: &mut Option<Principal>, request: Request) -> Value {
    match request {
        Request::Register { username, password } => {
            let hash = match auth::hash_password(&password) {
                Ok(h) => h,
                Err(e) => return protocol_err("auth", &format!("hashing failed: {e}")),
            };
            match engine.register_user(&username, hash, Role::User).await {
                Ok(user_id) => {
                    *session = Some(Principal {
                        user_id,
                        role: Role::User,
                    });
                    json!({ "ok": true, "user_id": user_id, "role": Role::User })
                }
                Err(e) => engine_err(e),
            }
        }
        Request::Login { username, password } => {
            let Some(user) = engine.find_user(&username) else {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                return protocol_err("auth", "invalid credentials");
            };
            let guard = user.read().await;
            if !auth::verify_password(&password, &guard.password_hash) {
                metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                return protocol_err("auth", "invalid credentials");
            }
            *session = Some(Principal {
                user_id: guard.id,
                role: guard.role,
            });
            json!({ "ok": true, "user_id": guard.id, "role": guard.role })
        }
        // Everything else requires a bound principal.
        other => match *session {
            Some(actor) => dispatch_authed(engine, actor, other).await,
            None => protocol_err("auth", "not authenticated"),
        },
    }
}

async fn dispatch_authed(engine: &Engine, actor: Principal, request: Request) -> Value {
    match request {
        Request::Register { .. } | Request::Login { .. } => unreachable!(),
        Request::CreateLot {
            name,
            address,
            pin_code,
            price,
            max_spots,
        } => {
            match engine
                .create_lot(&actor, name, address, pin_code, price, max_spots)
                .await
            {
                Ok(lot_id) => json!({ "ok": true, "lot_id": lot_id }),
                Err(e) => engine_err(e),
            }
        }
        Request::UpdateLot {
            lot_id,
            name,
            address,
            pin_code,
            price,
        } => {
            match engine
                .update_lot(&actor, lot_id, name, address, pin_code, price)
                .await
            {
                Ok(()) => json!({ "ok": true }),
                Err(e) => engine_err(e),
            }
        }
        Request::DeleteLot { lot_id } => match engine.delete_lot(&actor, lot_id).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => engine_err(e),
        },
        Request::AddSpots { lot_id, count } => match engine.add_spots(&actor, lot_id, count).await
        {
            Ok(spot_ids) => json!({ "ok": true, "spot_ids": spot_ids }),
            Err(e) => engine_err(e),
        },
        Request::DeleteSpot { spot_id } => match engine.delete_spot(&actor, spot_id).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => engine_err(e),
        },
        Request::DeleteUser { user_id } => match engine.delete_user(&actor, user_id).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => engine_err(e),
        },
        Request::Book {
            spot_id,
            start,
            end,
            rating,
            feedback,
        } => {
            let window = Window { start, end };
            match engine
                .create_reservation(&actor, spot_id, window, rating, feedback)
                .await
            {
                Ok((reservation_id, cost)) => {
                    json!({ "ok": true, "reservation_id": reservation_id, "cost": cost })
                }
                Err(e) => engine_err(e),
            }
        }
        Request::Checkout { reservation_id } => {
            match engine.checkout(&actor, reservation_id).await {
                Ok(at) => json!({ "ok": true, "checked_out_at": at }),
                Err(e) => engine_err(e),
            }
        }
        Request::Cancel { reservation_id } => match engine.cancel(&actor, reservation_id).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => engine_err(e),
        },
        Request::Rate {
            reservation_id,
            rating,
            feedback,
        } => {
            match engine
                .submit_rating(&actor, reservation_id, rating, feedback)
                .await
            {
                Ok(()) => json!({ "ok": true }),
                Err(e) => engine_err(e),
            }
        }
        Request::MyBookings => {
            let now = now_ms();
            engine.sweep_expired(now);
            let active = engine.active_bookings_for(actor.user_id, now).await;
            json!({ "ok": true, "active": active })
        }
        Request::History => {
            let bookings = engine.booking_history(actor.user_id).await;
            json!({ "ok": true, "bookings": bookings })
        }
        Request::TotalSpent => {
            let total = engine.total_spent(actor.user_id).await;
            json!({ "ok": true, "total": total })
        }
        Request::SearchLots { query, start, end } => {
            let window = match optional_window(start, end) {
                Ok(w) => w,
                Err(resp) => return resp,
            };
            engine.sweep_expired(now_ms());
            let lots = engine.search_lots(&query, window).await;
            json!({ "ok": true, "lots": lots })
        }
        Request::AvailableSpots { lot_id, start, end } => {
            let window = match optional_window(start, end) {
                Ok(w) => w,
                Err(resp) => return resp,
            };
            engine.sweep_expired(now_ms());
            match engine.available_spots(lot_id, window).await {
                Ok(spots) => json!({ "ok": true, "spots": spots }),
                Err(e) => engine_err(e),
            }
        }
        Request::LotSpots { lot_id } => {
            engine.sweep_expired(now_ms());
            match engine.spots_for_lot(lot_id).await {
                Ok(spots) => json!({ "ok": true, "spots": spots }),
                Err(e) => engine_err(e),
            }
        }
        Request::Stats => {
            if actor.role != Role::Admin {
                return engine_err(EngineError::AdminRequired);
            }
            let stats = engine.dashboard_stats().await;
            json!({ "ok": true, "stats": stats })
        }
        Request::Recent { limit } => {
            // Admins see the portal-wide feed, users their own.
            let bookings = if actor.role == Role::Admin {
                engine.recent_bookings(limit.min(100)).await
            } else {
                engine.recent_bookings_for(actor.user_id, limit.min(100)).await
            };
            json!({ "ok": true, "bookings": bookings })
        }
        Request::Sweep => {
            let released = engine.sweep_expired(now_ms());
            json!({ "ok": true, "released": released })
        }
    }
}
