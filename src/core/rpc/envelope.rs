//! The encoding envelope for large RPC payloads (§4.1, §6): `(encoding,
//! data)` with `encoding in {none, zlib+base64}`. The decoder rejects
//! unknown encodings. A body >= 512 bytes is compressed on encode; smaller
//! bodies are sent uncompressed.

use crate::core::errors::{GanetiError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Bodies at or above this size are zlib+base64 compressed on encode (§4.1).
pub const COMPRESSION_THRESHOLD: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    None,
    #[serde(rename = "zlib+base64")]
    ZlibBase64,
}

/// The wire envelope: `[encoding_tag, content]` as a two-element JSON array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub encoding: Encoding,
    pub content: String,
}

impl Envelope {
    /// Encodes `data`, compressing (zlib, then base64) when it is at least
    /// `COMPRESSION_THRESHOLD` bytes; leaves smaller payloads as plain text.
    pub fn encode(data: &[u8]) -> Result<Self> {
        if data.len() >= COMPRESSION_THRESHOLD {
            let mut encoder = ZlibEncoder::new(data, Compression::default());
            let mut compressed = Vec::new();
            encoder
                .read_to_end(&mut compressed)
                .map_err(|e| GanetiError::Internal(format!("zlib compression failed: {e}")))?;
            Ok(Self {
                encoding: Encoding::ZlibBase64,
                content: BASE64.encode(compressed),
            })
        } else {
            Ok(Self {
                encoding: Encoding::None,
                content: String::from_utf8_lossy(data).into_owned(),
            })
        }
    }

    /// Decodes back to raw bytes; an unrecognized encoding tag is a hard
    /// error at the `serde` deserialization boundary (`Encoding` has no
    /// catch-all variant), matching the spec's "rejects unknown encodings".
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self.encoding {
            Encoding::None => Ok(self.content.clone().into_bytes()),
            Encoding::ZlibBase64 => {
                let compressed = BASE64
                    .decode(&self.content)
                    .map_err(|e| GanetiError::Internal(format!("invalid base64 in envelope: {e}")))?;
                let mut decoder = ZlibDecoder::new(compressed.as_slice());
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| GanetiError::Internal(format!("zlib decompression failed: {e}")))?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_body_uncompressed() {
        let data = b"hello";
        let env = Envelope::encode(data).unwrap();
        assert_eq!(env.encoding, Encoding::None);
        assert_eq!(env.decode().unwrap(), data);
    }

    #[test]
    fn large_body_compressed_roundtrips() {
        let data = vec![b'x'; 2048];
        let env = Envelope::encode(&data).unwrap();
        assert_eq!(env.encoding, Encoding::ZlibBase64);
        assert_eq!(env.decode().unwrap(), data);
    }

    #[test]
    fn unknown_encoding_tag_rejected_at_deserialize() {
        let json = r#"{"encoding":"rot13","content":"abc"}"#;
        let parsed: std::result::Result<Envelope, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }
}
