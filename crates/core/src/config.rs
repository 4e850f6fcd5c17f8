//! Bridge configuration.

use crate::ensure;
use crate::protocol::FetchError;

/// Number of bytes requested from the host on every body read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 8192;

/// Tunables of the byte stream bridge.
///
/// The configuration is `Copy` and travels with every [`ReadableBody`](crate::body::ReadableBody)
/// and [`Body`](crate::body::Body) created from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    read_chunk_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { read_chunk_size: DEFAULT_READ_CHUNK_SIZE }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the host read chunk size, zero is rejected.
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Result<Self, FetchError> {
        ensure!(read_chunk_size > 0, FetchError::type_error("read chunk size must be greater than zero"));
        self.read_chunk_size = read_chunk_size;
        Ok(self)
    }

    #[inline]
    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_chunk_size() {
        assert_eq!(BridgeConfig::default().read_chunk_size(), 8192);
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let result = BridgeConfig::new().with_read_chunk_size(0);
        assert!(matches!(result, Err(FetchError::Type { .. })));

        let config = BridgeConfig::new().with_read_chunk_size(16).unwrap();
        assert_eq!(config.read_chunk_size(), 16);
    }
}
