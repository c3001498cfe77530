//! Chatline relay server library.
//!
//! A WebSocket relay for one-to-one direct messages. Clients authenticate
//! with a display name or a bearer token, exchange messages in two-party
//! conversations whose ids are derived from the participant pair, and see
//! who else is online. All state lives behind the [`store::Store`] trait.

pub mod config;
pub mod conversation;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod keys;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod store;

/// Current wall-clock time in unix seconds.
pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}
