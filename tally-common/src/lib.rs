//! Tally Common - Shared configuration and snapshot types for the Tally server

pub mod config;
pub mod snapshot;

pub use config::*;
pub use snapshot::*;
