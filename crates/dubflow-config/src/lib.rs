//! KDL configuration parsing for Dubflow worker runtimes.
//!
//! The stages target mutually incompatible runtimes (the cloning worker
//! needs a different isolated dependency set than the translation worker),
//! so each stage gets its own runtime profile: executable, arguments,
//! working directory, environment additions, and an optional timeout
//! override.

pub mod error;
pub mod runtime;

pub use error::{ConfigError, ConfigResult};
pub use runtime::{RuntimeProfiles, WorkerProfile};
