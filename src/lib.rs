pub mod auth;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod portal;
pub mod sweep;
pub mod wal;
pub mod wire;
