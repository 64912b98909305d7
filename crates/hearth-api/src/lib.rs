//! Slash commands, webhooks, plugin delegation and export for the Hearth
//! integration core, plus the HTTP surface that exposes them.

pub mod commands;
pub mod config;
pub mod error;
pub mod export;
pub mod handlers;
pub mod http_client;
pub mod mentions;
pub mod middleware;
pub mod plugins;
pub mod posts;
pub mod slack;
pub mod state;
pub mod trigger_id;
pub mod webhooks;

pub use config::Config;
pub use error::{AppError, ErrorKind};
pub use state::{AppState, AppStateInner};
