//! Compression hook consumed by the Blob Manager (spec §4.4, §9).
//!
//! Real codecs (LZ4, zstd, ...) are out of scope for the core; this module
//! only specifies the bounded-buffer interface the core consumes and ships
//! a no-op default.

use crate::error::{Error, Result};

pub trait Compressor: Send + Sync {
    /// Compress `src` into `dst`, returning the number of bytes written.
    /// `dst` is sized to `src.len()`; implementations that can't beat that
    /// bound should return `Err` so the caller stores the record uncompressed.
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decompress `src` (of length `compressed_len`) into `dst`, which is
    /// sized to exactly the original (logical) length.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// Default: never compresses. Always "fails" to beat the input size, which
/// is the signal the Blob Manager uses to store the payload uncompressed.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compress(&self, _src: &[u8], _dst: &mut [u8]) -> Result<usize> {
        Err(Error::LimitsReached("NoopCompressor never compresses"))
    }

    fn decompress(&self, _src: &[u8], _dst: &mut [u8]) -> Result<()> {
        Err(Error::InvalidParameter(
            "NoopCompressor cannot decompress a flagged-compressed blob",
        ))
    }
}
