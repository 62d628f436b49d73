use thiserror::Error;

use crate::codec::CHUNK_BYTES;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),
}

/// Tunables for per-asset chunk caching and fetch scheduling
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Soft byte budget for decrypted chunks retained per asset (default: 10 MiB)
    pub resident_byte_budget: usize,
    /// Number of chunks to prefetch beyond the most recent read position (default: 5)
    pub read_ahead: u32,
    /// Upper bound on concurrent chunk fetches per asset (default: 1)
    pub max_concurrent_fetches: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            resident_byte_budget: 10 * 1024 * 1024,
            read_ahead: 5,
            max_concurrent_fetches: 1,
        }
    }
}

impl StreamConfig {
    /// Soft cap on the number of Ready chunks retained per asset.
    ///
    /// The floor of 6 keeps a minimal working set alive even for a zero
    /// byte budget.
    pub fn resident_chunk_limit(&self) -> usize {
        6 + self.resident_byte_budget / CHUNK_BYTES
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
