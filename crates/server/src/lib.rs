//! CampusDock server
//!
//! Course records and accounts over HTTP, plus a live support chat that pairs
//! requesters with named agents over WebSocket. The SQLite store is opened
//! lazily and closed again once nobody needs it.

pub mod api;
pub mod auth;
pub mod clock;
pub mod cmd_status;
pub mod config;
pub mod crypto;
pub mod lifecycle;
pub mod logging;
pub mod migration_runner;
pub mod paths;
pub mod registry;
pub mod relay;
pub mod state;
pub mod store;
pub mod websocket;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
