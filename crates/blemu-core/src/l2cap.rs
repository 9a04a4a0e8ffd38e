//! Emulated L2CAP connection-oriented channels
//!
//! A channel is one end of an in-memory duplex stream pair created by the
//! Bus when a central opens a published PSM. Both ends speak plain
//! `AsyncRead`/`AsyncWrite`; there is no packetization layer, matching the
//! stream-oriented contract of a credit-based L2CAP channel.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::types::DeviceId;

/// Buffer capacity of each emulated channel direction.
const CHANNEL_CAPACITY: usize = 64 * 1024;

/// First dynamically allocated PSM handed out by the Bus.
pub const FIRST_DYNAMIC_PSM: u16 = 0x0080;

/// One end of an open L2CAP channel
pub struct L2capChannel {
    psm: u16,
    peer: DeviceId,
    stream: DuplexStream,
}

impl L2capChannel {
    /// Create a connected pair for the given PSM. The first end is handed to
    /// the opener (central side), the second to the publisher.
    pub(crate) fn pair(psm: u16, central: DeviceId, peripheral: DeviceId) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(CHANNEL_CAPACITY);
        (
            Self {
                psm,
                peer: peripheral,
                stream: a,
            },
            Self {
                psm,
                peer: central,
                stream: b,
            },
        )
    }

    /// The PSM this channel was opened against
    pub fn psm(&self) -> u16 {
        self.psm
    }

    /// Identifier of the entity at the other end
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    /// Unwrap into the raw stream
    pub fn into_stream(self) -> DuplexStream {
        self.stream
    }
}

impl AsyncRead for L2capChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for L2capChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2capChannel")
            .field("psm", &self.psm)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn pair_is_bidirectional() {
        let central = DeviceId::new();
        let peripheral = DeviceId::new();
        let (mut opener, mut publisher) = L2capChannel::pair(0x0080, central, peripheral);

        assert_eq!(opener.peer(), peripheral);
        assert_eq!(publisher.peer(), central);

        opener.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        publisher.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        publisher.write_all(b"pong").await.unwrap();
        opener.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
