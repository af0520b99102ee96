//! Operator control surface and observer stream.
//!
//! Exposes status reads, kill-switch control (escalate / de-escalate /
//! emergency), health probes, and the SSE event stream. Everything but
//! `/health` requires the configured bearer token.

pub mod auth;
pub mod routes;
pub mod sse;
pub mod state;

use axum::routing::{get, post};
use axum::Router;

pub use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .route("/killswitch/escalate", post(routes::escalate))
        .route("/killswitch/deescalate", post(routes::deescalate))
        .route("/killswitch/emergency", post(routes::emergency))
        .route("/killswitch/history", get(routes::killswitch_history))
        .route("/engine/unlock", post(routes::release_safety_lock))
        .route("/zkp/proofs", post(routes::submit_proof))
        .route("/events", get(sse::event_stream))
        .with_state(state)
}
