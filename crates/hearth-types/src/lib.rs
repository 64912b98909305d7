//! Shared data model and wire types for the Hearth integration core.
//!
//! Everything here is plain data: no I/O, no async. The store, gateway and
//! api crates all speak in these types.

pub mod api;
pub mod events;
pub mod models;

use uuid::Uuid;

/// Generate a new record id (32 lowercase hex chars).
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// True when `id` looks like something produced by [`new_id`].
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}
