//! Skin service: cached, rate-limited retrieval of player skin textures

pub mod cache;
pub mod fetch;
pub mod service;

pub use cache::SkinCache;
pub use fetch::{BackoffPolicy, FetchError, SkinFetcher};
pub use service::SkinService;

use bytes::{Buf, Bytes, BytesMut};
use uuid::Uuid;

use crate::codec::{self, CodecError};

/// A cached skin record. Immutable once built; an update is a whole-record
/// replacement under the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSkin {
    /// Normalized owner UUID (32 lowercase hex chars), the storage key
    pub uuid: String,
    /// Unix-millis expiry stamped by the caller at store time
    pub expires_at: u64,
    /// Raw fetched texture bytes
    pub data: Bytes,
}

impl CachedSkin {
    /// Encode to the persisted layout:
    /// `[string uuid][varlong expires_at][bytes data]`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.uuid.len() + self.data.len() + 16);
        codec::write_string(&mut buf, &self.uuid);
        codec::write_varlong(&mut buf, self.expires_at);
        codec::write_bytes(&mut buf, &self.data);
        buf.freeze()
    }

    /// Decode a persisted record, the exact left-to-right inverse of
    /// [`encode`](CachedSkin::encode).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        let uuid = codec::read_string(buf)?;
        let expires_at = codec::read_varlong(buf)?;
        let data = codec::read_bytes(buf)?;
        Ok(Self { uuid, expires_at, data })
    }
}

/// Canonicalize an externally supplied skin owner UUID into the storage key
/// form: 32 lowercase hex chars, no separators. Differently formatted
/// equivalent ids map to the same key, and nothing that could escape the
/// cache directory survives normalization.
pub fn normalize_uuid(id: &str) -> Option<String> {
    Uuid::parse_str(id).ok().map(|u| u.simple().to_string())
}

/// Transform a raw fetched texture into the wire format.
///
/// Selectable seam: the shipped [`PassthroughProcessor`] is the portable
/// implementation; a native-accelerated pixel converter plugs in here.
pub trait SkinProcessor: Send + Sync {
    fn to_wire_format(&self, raw: &[u8]) -> Result<Bytes, ProcessError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Payload is not a PNG image")]
    NotPng,
}

const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Portable processor: validates the PNG signature and forwards the bytes
/// unchanged. Pixel-format conversion lives behind the trait.
pub struct PassthroughProcessor;

impl SkinProcessor for PassthroughProcessor {
    fn to_wire_format(&self, raw: &[u8]) -> Result<Bytes, ProcessError> {
        if raw.len() < PNG_MAGIC.len() || raw[..PNG_MAGIC.len()] != PNG_MAGIC {
            return Err(ProcessError::NotPng);
        }
        Ok(Bytes::copy_from_slice(raw))
    }
}
