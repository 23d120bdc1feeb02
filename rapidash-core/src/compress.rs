//! Transparent payload compression. Both drivers run every stored value
//! through the configured [`Compressor`] on the way out and back in.

use crate::error::Error;

/// Compresses and decompresses payload bytes. Implement this to plug in a
/// different algorithm; [`NoCompressor`] disables compression and
/// [`ZlibCompressor`] is provided behind the default `zlib` feature.
///
/// The compressor is applied unconditionally: the item flags field carries
/// the key hash, so there is no spare bit to mark individual payloads.
pub trait Compressor: Clone + Send + Sync + 'static {
    fn compress(&self, value: Vec<u8>) -> Result<Vec<u8>, Error>;
    fn decompress(&self, value: Vec<u8>) -> Result<Vec<u8>, Error>;
}

/// A [`Compressor`] that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompressor;

impl Compressor for NoCompressor {
    fn compress(&self, value: Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(value)
    }

    fn decompress(&self, value: Vec<u8>) -> Result<Vec<u8>, Error> {
        Ok(value)
    }
}

#[cfg(feature = "zlib")]
pub use self::zlib::ZlibCompressor;

#[cfg(feature = "zlib")]
mod zlib {
    use std::io::Write;

    use flate2::write::{ZlibDecoder, ZlibEncoder};
    use flate2::Compression;

    use super::Compressor;
    use crate::error::Error;

    /// Zlib compression of every payload.
    #[derive(Debug, Clone, Copy)]
    pub struct ZlibCompressor {
        compression: Compression,
    }

    impl ZlibCompressor {
        pub fn new(compression: Compression) -> Self {
            ZlibCompressor { compression }
        }
    }

    impl Default for ZlibCompressor {
        fn default() -> Self {
            ZlibCompressor::new(Compression::default())
        }
    }

    impl Compressor for ZlibCompressor {
        fn compress(&self, value: Vec<u8>) -> Result<Vec<u8>, Error> {
            let mut enc = ZlibEncoder::new(Vec::new(), self.compression);
            enc.write_all(&value)?;
            Ok(enc.finish()?)
        }

        fn decompress(&self, value: Vec<u8>) -> Result<Vec<u8>, Error> {
            let mut dec = ZlibDecoder::new(Vec::new());
            dec.write_all(&value)?;
            Ok(dec.finish()?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_compressor_is_identity() {
        let payload = b"payload".to_vec();
        assert_eq!(payload, NoCompressor.compress(payload.clone()).unwrap());
        assert_eq!(payload, NoCompressor.decompress(payload.clone()).unwrap());
    }

    #[cfg(feature = "zlib")]
    #[test]
    fn test_zlib_round_trip() {
        use flate2::Compression;

        let compressor = ZlibCompressor::new(Compression::new(9));
        let payload = vec![0_u8; 256];
        let compressed = compressor.compress(payload.clone()).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(payload, compressor.decompress(compressed).unwrap());
    }
}
