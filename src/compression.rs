//! Attachment compression.
//!
//! Attachments are stored either verbatim or as a zlib stream prefixed with
//! the uncompressed size, so that a corrupted blob can be detected without
//! decompressing it entirely.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::errors::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionScheme {
    None = 1,
    ZlibWithSize = 2,
}

impl CompressionScheme {
    pub fn from_db(value: i64) -> VaultResult<Self> {
        match value {
            1 => Ok(CompressionScheme::None),
            2 => Ok(CompressionScheme::ZlibWithSize),
            _ => Err(VaultError::ParameterOutOfRange {
                message: format!("unknown compression scheme {}", value),
            }),
        }
    }
}

/// Compress `data` with the zlib-with-size framing: a little-endian u64
/// holding the uncompressed size, followed by the zlib stream.
pub fn zlib_compress(data: &[u8]) -> VaultResult<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len() / 2 + 8);
    result.extend_from_slice(&(data.len() as u64).to_le_bytes());

    let mut encoder = ZlibEncoder::new(result, Compression::default());
    encoder.write_all(data).map_err(|e| VaultError::Internal {
        message: format!("zlib compression failed: {}", e),
    })?;
    encoder.finish().map_err(|e| VaultError::Internal {
        message: format!("zlib compression failed: {}", e),
    })
}

/// Inverse of [`zlib_compress`]. Fails with `CorruptedFile` if the stream
/// does not inflate to the recorded size.
pub fn zlib_uncompress(data: &[u8]) -> VaultResult<Vec<u8>> {
    if data.len() < 8 {
        return Err(VaultError::CorruptedFile {
            what: "zlib stream shorter than its size header".to_string(),
        });
    }

    let mut size = [0u8; 8];
    size.copy_from_slice(&data[..8]);
    let expected = u64::from_le_bytes(size) as usize;

    let mut result = Vec::with_capacity(expected);
    let mut decoder = ZlibDecoder::new(&data[8..]);
    decoder
        .read_to_end(&mut result)
        .map_err(|_| VaultError::CorruptedFile {
            what: "invalid zlib stream".to_string(),
        })?;

    if result.len() != expected {
        return Err(VaultError::CorruptedFile {
            what: format!(
                "zlib stream inflates to {} bytes, {} recorded",
                result.len(),
                expected
            ),
        });
    }
    Ok(result)
}

/// Hex MD5 digest of a buffer, used for attachment integrity checks.
pub fn compute_md5(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_round_trip() {
        let data = b"DICM some pixel data that compresses reasonably well \
                     because it repeats repeats repeats repeats";
        let compressed = zlib_compress(data).unwrap();
        assert_eq!(zlib_uncompress(&compressed).unwrap(), data.to_vec());
    }

    #[test]
    fn empty_round_trip() {
        let compressed = zlib_compress(b"").unwrap();
        assert_eq!(zlib_uncompress(&compressed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn size_mismatch_is_corrupted() {
        let mut compressed = zlib_compress(b"hello world").unwrap();
        // lie about the uncompressed size
        compressed[0] = 1;
        assert!(matches!(
            zlib_uncompress(&compressed),
            Err(VaultError::CorruptedFile { .. })
        ));
    }

    #[test]
    fn truncated_header_is_corrupted() {
        assert!(matches!(
            zlib_uncompress(&[1, 2, 3]),
            Err(VaultError::CorruptedFile { .. })
        ));
    }

    #[test]
    fn md5_is_stable() {
        assert_eq!(compute_md5(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }
}
