use ulid::Ulid;

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    /// Requested window violates booking policy. No state change.
    Validation(&'static str),
    /// Requested window collides with an existing reservation on the spot.
    Conflict(Ulid),
    /// Actor does not own the target reservation.
    Unauthorized(Ulid),
    /// Operation requires the admin capability.
    AdminRequired,
    /// Operation not valid in the reservation's current lifecycle state.
    InvalidState(&'static str),
    UsernameTaken(String),
    /// Lot already holds its maximum number of spots.
    CapacityExceeded(u32),
    LimitExceeded(&'static str),
    /// Storage write failed; nothing was applied. Retryable.
    Wal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Validation(msg) => write!(f, "invalid booking window: {msg}"),
            EngineError::Conflict(id) => {
                write!(f, "spot already booked in this window (reservation {id})")
            }
            EngineError::Unauthorized(id) => {
                write!(f, "reservation {id} belongs to another user")
            }
            EngineError::AdminRequired => write!(f, "admin capability required"),
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::UsernameTaken(name) => write!(f, "username taken: {name}"),
            EngineError::CapacityExceeded(max) => {
                write!(f, "lot is at its maximum of {max} spots")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Stable machine-readable kind, used by the wire layer and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Validation(_) => "validation",
            EngineError::Conflict(_) => "conflict",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::AdminRequired => "admin_required",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::UsernameTaken(_) => "username_taken",
            EngineError::CapacityExceeded(_) => "capacity_exceeded",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Wal(_) => "persistence",
        }
    }
}
