//! WebSocket transport: channel frames and session handling

pub mod handler;
pub mod protocol;

use std::net::IpAddr;

use tokio::sync::mpsc;

use protocol::ChannelFrame;

/// Returned by [`ClientHandle::write`] when the session's write side is gone
#[derive(Debug, thiserror::Error)]
#[error("Session closed")]
pub struct SessionClosed;

/// Handle to a connected client, handed to request handlers: the caller's
/// identity for rate-limiter keying plus the write half of the session.
#[derive(Clone)]
pub struct ClientHandle {
    pub username: String,
    pub addr: IpAddr,
    out: mpsc::Sender<ChannelFrame>,
}

impl ClientHandle {
    pub fn new(username: impl Into<String>, addr: IpAddr, out: mpsc::Sender<ChannelFrame>) -> Self {
        Self {
            username: username.into(),
            addr,
            out,
        }
    }

    /// Queue an outbound frame for this client.
    pub async fn write(&self, frame: ChannelFrame) -> Result<(), SessionClosed> {
        self.out.send(frame).await.map_err(|_| SessionClosed)
    }
}
