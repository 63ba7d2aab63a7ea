//! Resilient, reconnecting WebSocket event transport with pluggable
//! serialization and validation.

pub mod error;
pub mod ws;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;
