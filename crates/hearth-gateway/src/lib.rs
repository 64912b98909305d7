//! Websocket side of the integration core: session gate, per-connection
//! pump, broadcast filter and the hub that fans events out.

pub mod auth;
pub mod connection;
pub mod filter;
pub mod frame;
pub mod hub;
pub mod presence;
pub mod readiness;
pub mod router;
pub mod session;

pub use auth::{JwtSessionGate, SessionError, SessionGate, SessionGrant};
pub use connection::{ConnContext, PumpConfig, WebConn};
pub use hub::Hub;
pub use readiness::PumpMode;
