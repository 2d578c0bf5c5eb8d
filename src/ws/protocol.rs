//! WebSocket protocol message definitions
//! These are the binary wire types for client-server communication

use bytes::{Buf, Bytes, BytesMut};

use crate::codec::{self, CodecError};

/// Channel carrying skin requests and responses
pub const SKIN_CHANNEL: &str = "CG|Skins";

/// Request kind: fetch a skin by source URL
pub const KIND_FETCH_BY_URL: u8 = 0x01;
/// Response kind: fetched skin payload
pub const KIND_FETCH_RESULT: u8 = 0x02;

/// Protocol errors: fatal to the request, not to the connection
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Message on unexpected channel {0:?}")]
    WrongChannel(String),

    #[error("Unknown operation {0:#04x}")]
    UnknownOperation(u8),

    #[error("Malformed packet: {0}")]
    Malformed(#[from] CodecError),

    #[error("Invalid skin id {0:?}")]
    InvalidSkinId(String),
}

/// A typed channel message: `[string channel][remaining bytes payload]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFrame {
    pub channel: String,
    pub data: Bytes,
}

impl ChannelFrame {
    pub fn new(channel: impl Into<String>, data: Bytes) -> Self {
        Self {
            channel: channel.into(),
            data,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.channel.len() + self.data.len() + 4);
        codec::write_string(&mut buf, &self.channel);
        buf.extend_from_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> Result<Self, CodecError> {
        let channel = codec::read_string(&mut raw)?;
        Ok(Self { channel, data: raw })
    }
}

/// Inbound skin channel packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkinRequest {
    /// Fetch the skin at `url` for player `uuid`:
    /// `[u8 kind][string uuid][string url]`
    FetchByUrl { uuid: String, url: String },
}

impl SkinRequest {
    pub fn decode(mut data: Bytes) -> Result<Self, ProtocolError> {
        if !data.has_remaining() {
            return Err(CodecError::Truncated { needed: 1 }.into());
        }
        let kind = data.get_u8();
        match kind {
            KIND_FETCH_BY_URL => {
                let uuid = codec::read_string(&mut data)?;
                let url = codec::read_string(&mut data)?;
                Ok(Self::FetchByUrl { uuid, url })
            }
            other => Err(ProtocolError::UnknownOperation(other)),
        }
    }

    #[cfg(test)]
    pub fn encode(&self) -> Bytes {
        match self {
            Self::FetchByUrl { uuid, url } => {
                let mut buf = BytesMut::new();
                buf.extend_from_slice(&[KIND_FETCH_BY_URL]);
                codec::write_string(&mut buf, uuid);
                codec::write_string(&mut buf, url);
                buf.freeze()
            }
        }
    }
}

/// Outbound skin channel packets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkinResponse {
    /// Result of a fetch: `[u8 kind][string uuid][bytes skin]`
    FetchResult { uuid: String, skin: Bytes },
}

impl SkinResponse {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::FetchResult { uuid, skin } => {
                let mut buf = BytesMut::with_capacity(uuid.len() + skin.len() + 8);
                buf.extend_from_slice(&[KIND_FETCH_RESULT]);
                codec::write_string(&mut buf, uuid);
                codec::write_bytes(&mut buf, skin);
                buf.freeze()
            }
        }
    }

    /// Wrap into a frame on the skin channel.
    pub fn into_frame(self) -> ChannelFrame {
        let data = self.encode();
        ChannelFrame::new(SKIN_CHANNEL, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips() {
        let frame = ChannelFrame::new(SKIN_CHANNEL, Bytes::from_static(b"\x01payload"));
        let decoded = ChannelFrame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn frame_with_empty_payload_roundtrips() {
        let frame = ChannelFrame::new("CG|Other", Bytes::new());
        assert_eq!(ChannelFrame::decode(frame.encode()).unwrap(), frame);
    }

    #[test]
    fn fetch_request_roundtrips() {
        let req = SkinRequest::FetchByUrl {
            uuid: "d8b13b7a-f4b1-481f-906d-c5b2a0c4cbb8".to_string(),
            url: "https://textures.example.com/skin.png".to_string(),
        };
        assert_eq!(SkinRequest::decode(req.encode()).unwrap(), req);
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let raw = Bytes::from_static(&[0x7f, 0, 0]);
        assert!(matches!(
            SkinRequest::decode(raw),
            Err(ProtocolError::UnknownOperation(0x7f))
        ));
    }

    #[test]
    fn empty_packet_is_malformed() {
        assert!(matches!(
            SkinRequest::decode(Bytes::new()),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_request_is_malformed() {
        let encoded = SkinRequest::FetchByUrl {
            uuid: "d8b13b7af4b1481f906dc5b2a0c4cbb8".to_string(),
            url: "https://textures.example.com/skin.png".to_string(),
        }
        .encode();
        let truncated = encoded.slice(..encoded.len() - 10);
        assert!(matches!(
            SkinRequest::decode(truncated),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn response_lands_on_the_skin_channel() {
        let frame = SkinResponse::FetchResult {
            uuid: "d8b13b7af4b1481f906dc5b2a0c4cbb8".to_string(),
            skin: Bytes::from_static(b"pixels"),
        }
        .into_frame();
        assert_eq!(frame.channel, SKIN_CHANNEL);
        assert_eq!(frame.data[0], KIND_FETCH_RESULT);
    }
}
