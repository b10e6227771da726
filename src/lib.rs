#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! foxy-switch library: a small HTTP relay that switches groups of
//! Homebridge lights.
//!
//! - `config` — configuration loading (file, env overrides, legacy migration)
//! - `registry` — static light-group registry
//! - `upstream` — Homebridge REST client and Socket.IO event stream
//! - `session` — token lifecycle and event-stream channel ownership
//! - `warm` — accessory-cache warm-up tracking
//! - `dispatch` — per-device control with fallback and retry
//! - `keepalive` — periodic refresh and warm-up tasks
//! - `routes` — HTTP API handlers

pub mod config;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod registry;
pub mod routes;
pub mod session;
pub mod state;
pub mod upstream;
pub mod warm;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use dispatch::Dispatcher;
pub use registry::GroupRegistry;
pub use session::SessionManager;
pub use state::AppState;
pub use warm::WarmTracker;
