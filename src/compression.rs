// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Compression algorithm to use
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub enum CompressionType {
    /// No compression
    None,

    /// Deflate compression
    ///
    /// Always available; also used for oversized WAL record payloads.
    Deflate,

    /// LZ4 compression
    ///
    /// Recommended for use cases with a focus
    /// on speed over compression ratio.
    #[cfg(feature = "lz4")]
    Lz4,

    /// Zstandard compression
    #[cfg(feature = "zstd")]
    Zstd,

    /// Snappy compression
    #[cfg(feature = "snappy")]
    Snappy,
}

impl CompressionType {
    /// Compresses a payload.
    pub fn compress(self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(match self {
            Self::None => bytes.to_vec(),

            Self::Deflate => {
                let mut encoder = flate2::write::DeflateEncoder::new(
                    Vec::with_capacity(bytes.len() / 2),
                    flate2::Compression::default(),
                );
                encoder.write_all(bytes).map_err(crate::Error::Io)?;
                encoder.finish().map_err(crate::Error::Io)?
            }

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::compress_prepend_size(bytes),

            #[cfg(feature = "zstd")]
            Self::Zstd => zstd::encode_all(bytes, 0).map_err(crate::Error::Io)?,

            #[cfg(feature = "snappy")]
            Self::Snappy => snap::raw::Encoder::new()
                .compress_vec(bytes)
                .map_err(|_| crate::Error::Decompress(self))?,
        })
    }

    /// Decompresses a payload.
    pub fn decompress(self, bytes: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(match self {
            Self::None => bytes.to_vec(),

            Self::Deflate => {
                let mut decoder = flate2::read::DeflateDecoder::new(bytes);
                let mut out = Vec::with_capacity(bytes.len() * 2);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|_| crate::Error::Decompress(self))?;
                out
            }

            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress_size_prepended(bytes)
                .map_err(|_| crate::Error::Decompress(self))?,

            #[cfg(feature = "zstd")]
            Self::Zstd => zstd::decode_all(bytes).map_err(|_| crate::Error::Decompress(self))?,

            #[cfg(feature = "snappy")]
            Self::Snappy => snap::raw::Decoder::new()
                .decompress_vec(bytes)
                .map_err(|_| crate::Error::Decompress(self))?,
        })
    }
}

impl Encode for CompressionType {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(match self {
            Self::None => 0,
            Self::Deflate => 1,

            #[cfg(feature = "lz4")]
            Self::Lz4 => 2,

            #[cfg(feature = "zstd")]
            Self::Zstd => 3,

            #[cfg(feature = "snappy")]
            Self::Snappy => 4,
        })?;

        Ok(())
    }
}

impl Decode for CompressionType {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;

        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::Deflate),

            #[cfg(feature = "lz4")]
            2 => Ok(Self::Lz4),

            #[cfg(feature = "zstd")]
            3 => Ok(Self::Zstd),

            #[cfg(feature = "snappy")]
            4 => Ok(Self::Snappy),

            tag => Err(DecodeError::InvalidTag(("CompressionType", tag))),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "no compression",
                Self::Deflate => "deflate",

                #[cfg(feature = "lz4")]
                Self::Lz4 => "lz4",

                #[cfg(feature = "zstd")]
                Self::Zstd => "zstd",

                #[cfg(feature = "snappy")]
                Self::Snappy => "snappy",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn compression_serialize_none() {
        let serialized = CompressionType::None.encode_into_vec();
        assert_eq!(1, serialized.len());
    }

    #[test]
    fn compression_deflate_roundtrip() -> crate::Result<()> {
        let payload = b"abcabcabcabcabcabcabc".repeat(50);

        let compressed = CompressionType::Deflate.compress(&payload)?;
        assert!(compressed.len() < payload.len());

        let restored = CompressionType::Deflate.decompress(&compressed)?;
        assert_eq!(payload, restored);

        Ok(())
    }

    #[cfg(feature = "lz4")]
    mod lz4 {
        use super::*;
        use test_log::test;

        #[test]
        fn compression_lz4_roundtrip() -> crate::Result<()> {
            let payload = b"abcabcabcabcabcabcabc".repeat(50);

            let compressed = CompressionType::Lz4.compress(&payload)?;
            let restored = CompressionType::Lz4.decompress(&compressed)?;
            assert_eq!(payload, restored);

            Ok(())
        }
    }
}
