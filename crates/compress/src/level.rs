use std::num::NonZeroU8;

use flate2::Compression;
use thiserror::Error;

/// Compression levels recognised by the deflate encoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CompressionLevel {
    /// No compression (level 0); data is stored without deflation.
    None,
    /// Favour speed over compression ratio.
    Fast,
    /// zlib's default balance between speed and ratio.
    Default,
    /// Favour the best possible compression ratio.
    Best,
    /// An explicit zlib compression level in the range `1..=9`.
    Precise(NonZeroU8),
}

impl CompressionLevel {
    /// Creates a level from an explicit numeric value.
    ///
    /// Level 0 maps to [`CompressionLevel::None`]; levels 1-9 map to
    /// [`CompressionLevel::Precise`].
    ///
    /// # Errors
    ///
    /// Returns [`CompressionLevelError`] when `level` falls outside the
    /// inclusive range `0..=9` accepted by zlib.
    pub fn from_numeric(level: u32) -> Result<Self, CompressionLevelError> {
        if level > 9 {
            return Err(CompressionLevelError { level });
        }
        Ok(match NonZeroU8::new(level as u8) {
            None => Self::None,
            Some(precise) => Self::Precise(precise),
        })
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::Default
    }
}

impl From<CompressionLevel> for Compression {
    fn from(level: CompressionLevel) -> Self {
        match level {
            CompressionLevel::None => Compression::none(),
            CompressionLevel::Fast => Compression::fast(),
            CompressionLevel::Default => Compression::default(),
            CompressionLevel::Best => Compression::best(),
            CompressionLevel::Precise(value) => Compression::new(u32::from(value.get())),
        }
    }
}

/// Error returned when a requested compression level falls outside the
/// permissible zlib range.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[error("compression level {level} is outside the supported range 0-9")]
pub struct CompressionLevelError {
    level: u32,
}

impl CompressionLevelError {
    /// Returns the invalid compression level that triggered the error.
    #[must_use]
    pub const fn level(&self) -> u32 {
        self.level
    }
}
