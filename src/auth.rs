//! Password hashing and the authenticated principal flowing through every
//! engine call. The admin capability is a property of the principal, checked
//! per operation — never ambient connection state.

use ulid::Ulid;

use crate::model::Role;

/// Who is acting. Produced by register/login on a wire connection and passed
/// explicitly into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub role: Role,
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}
