//! # Delegate Gateway
//!
//! Thin HTTP + SSE glue over the core: JSON handlers for teams,
//! tasks, and messages, plus the activity event stream for the web UI.
//! Errors map to `{"detail": ...}` bodies with the status codes of the
//! core error taxonomy.

pub mod routes;
pub mod server;
pub mod sse;

pub use server::{build_router, serve, AppState};
