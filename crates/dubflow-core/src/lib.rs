//! Core domain types and traits for the Dubflow dubbing pipeline.
//!
//! This crate contains:
//! - Task identifiers and the durable task model
//! - Stage and language vocabulary
//! - The per-task filesystem layout
//! - SRT subtitle parsing and rendering
//! - The external worker contract (trait and wire types)

pub mod error;
pub mod id;
pub mod language;
pub mod paths;
pub mod stage;
pub mod subtitle;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
pub use id::TaskId;
pub use language::DEFAULT_LANG;
pub use stage::Stage;
