//! Configuration for the embedding process
//!
//! The storage core itself is configuration-free; what is tunable is the
//! symbolization side-loop. Config structs deserialize from whatever format
//! the embedding service uses and validate before use.

use serde::{Deserialize, Serialize};

/// Configuration for the symbolizer loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolizerConfig {
    /// How often a `(build id, address)` pair may come back without lines
    /// before it is marked permanently failed and skipped.
    pub attempt_threshold: u32,
}

impl Default for SymbolizerConfig {
    fn default() -> Self {
        Self {
            attempt_threshold: 3,
        }
    }
}

impl SymbolizerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.attempt_threshold == 0 {
            return Err("attempt_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}
