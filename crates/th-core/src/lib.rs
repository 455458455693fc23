//! th-core: shared configuration, error type and identifiers.
//!
//! Every other th-* crate depends on this one. It carries no I/O beyond
//! reading the configuration file.

pub mod config;
pub mod error;
pub mod ids;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::ChannelId;
