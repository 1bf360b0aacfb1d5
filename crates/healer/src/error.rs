//! Error types for the Healer.
//!
//! Only conditions the caller cannot reasonably recover from live here.
//! Expected failure paths (no matching scenario, exhausted budget, a spell
//! that could not fix anything) are ordinary return values instead.

use thiserror::Error;

/// Errors that escape the Healer façade.
#[derive(Debug, Error)]
pub enum HealerError {
    /// The healer configuration is malformed
    #[error("Invalid healer configuration: {0}")]
    InvalidConfig(String),

    /// A spell name in `spells.allowed` / `spells.forbidden` is not known
    #[error("Unknown spell in healer configuration: {0}")]
    UnknownSpell(String),

    /// `run` was called for an event that does not map to any scenario
    #[error("No healer scenario matched event '{0}'")]
    NoScenario(String),

    /// Filesystem error while loading inputs
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = HealerError> = std::result::Result<T, E>;
