//! HTTP gateway — the transport adapter between the agent stream driver
//! and the browser, plus the surrounding routes.

pub mod auth;
pub mod rate_limit;
pub mod routes;
pub mod server;
pub mod state;
pub mod stream;
pub mod webhook;

pub use server::{app, serve};
pub use state::AppState;
