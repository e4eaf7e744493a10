//! Engine configuration

use crate::DEFAULT_CHUNK_SIZE;
use crate::error::{Error, Result};
use std::time::Duration;

/// Largest accepted chunk size (16 MiB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Transfer engine configuration
#[derive(Debug, Clone)]
pub struct ShareConfig {
    /// Payload bytes read and written per chunk
    pub chunk_size: usize,

    /// Bound on a single socket write (metadata frame or chunk)
    pub write_timeout: Duration,

    /// Bound on a single content read
    pub read_timeout: Duration,

    /// Grace period between requesting cancellation and force-closing sessions
    pub shutdown_timeout: Duration,

    /// Terminal sessions kept in history
    pub history_capacity: usize,

    /// Log events kept for late observers
    pub log_capacity: usize,

    /// Per-subscriber event queue depth before the oldest events are dropped
    pub event_capacity: usize,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(5),
            history_capacity: 1000,
            log_capacity: 1000,
            event_capacity: 4096,
        }
    }
}

impl ShareConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the chunk size is out of range or
    /// any timeout or capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidConfig(
                format!(
                    "chunk size must be between 1 and {MAX_CHUNK_SIZE} bytes, got {}",
                    self.chunk_size
                )
                .into(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::invalid_config("write timeout must be non-zero"));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::invalid_config("read timeout must be non-zero"));
        }
        if self.shutdown_timeout.is_zero() {
            return Err(Error::invalid_config("shutdown timeout must be non-zero"));
        }
        if self.history_capacity == 0 || self.log_capacity == 0 || self.event_capacity == 0 {
            return Err(Error::invalid_config("capacities must be non-zero"));
        }
        Ok(())
    }

    /// Set the chunk size
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the shutdown grace period
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the socket write timeout
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ShareConfig::default();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(ShareConfig::default().with_chunk_size(0).validate().is_err());
        assert!(ShareConfig::default().with_chunk_size(1).validate().is_ok());
        assert!(
            ShareConfig::default()
                .with_chunk_size(MAX_CHUNK_SIZE)
                .validate()
                .is_ok()
        );
        assert!(
            ShareConfig::default()
                .with_chunk_size(MAX_CHUNK_SIZE + 1)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = ShareConfig::default().with_shutdown_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let config = ShareConfig::default().with_write_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ShareConfig {
            history_capacity: 0,
            ..ShareConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
