//! HTTP and WebSocket edge of the leaderboard pipeline.
//!
//! Hosts score submission, the `/online-game` viewer socket and the
//! broadcaster that fans each leaderboard snapshot out to every viewer.

pub mod app;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod router;
pub mod state;

pub use app::{App, build_backends};
pub use config::{Backend, Config};
pub use router::create_router;
pub use state::AppState;
