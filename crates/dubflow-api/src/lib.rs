//! API server for the Dubflow dubbing pipeline.
//!
//! A thin adapter over the core components: argument validation, error
//! translation, and forwarding. Long-running work never executes on the
//! request handler; stage triggers return 202 and clients observe progress
//! over the push channel or the status endpoints.

pub mod error;
pub mod media;
pub mod routes;
pub mod state;
pub mod ws;

pub use state::AppState;
