//! Pool configuration

use corio_core::env::env_get;

/// Default per-coroutine stack size (256 KiB).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default number of pooled coroutine slots.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Configuration for the global coroutine pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of pre-built pooled coroutine slots
    pub pool_size: usize,

    /// Stack size per coroutine, in bytes
    pub stack_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: env_get("CORIO_POOL_SIZE", DEFAULT_POOL_SIZE),
            stack_size: env_get("CORIO_STACK_SIZE", DEFAULT_STACK_SIZE),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of pooled slots
    pub fn pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    /// Set the per-coroutine stack size
    pub fn stack_size(mut self, n: usize) -> Self {
        self.stack_size = n;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pool_size == 0 {
            return Err("pool_size must be at least 1");
        }
        if self.stack_size < 16 * 1024 {
            return Err("stack_size must be at least 16 KiB");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let cfg = PoolConfig::new().pool_size(8).stack_size(64 * 1024);
        assert_eq!(cfg.pool_size, 8);
        assert!(cfg.validate().is_ok());
        assert!(PoolConfig::new().pool_size(0).validate().is_err());
        assert!(PoolConfig::new().stack_size(1024).validate().is_err());
    }
}
