//! # Rota Gateway
//!
//! JSON HTTP API over a running scheduler: job and run status, captured
//! output, and the control verbs used by `rotactl`.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
