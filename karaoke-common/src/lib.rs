//! karaoke-common - shared types for the karaoke engine workspace
//!
//! Provides the common error type, configuration loading, and the event
//! system used by the engine crate and its binary.

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
