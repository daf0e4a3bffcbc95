//! External worker adapter.
//!
//! Spawns one external processing program per stage invocation, relays its
//! progress lines, and collects its final JSON result.

pub mod output;
pub mod progress;
pub mod subprocess;

pub use subprocess::SubprocessWorker;
