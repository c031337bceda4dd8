//! Framed message transport.
//!
//! A [`FramedLink`] is a reliable, ordered, connection-oriented channel that
//! carries whole frames. The transport owns framing and encryption; this crate
//! sees channels. Dropping the outgoing sender closes the link, and the
//! incoming receiver ending means the peer or transport closed it.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::PeerAddress;
use crate::error::Result;

/// An established link
#[derive(Debug)]
pub struct FramedLink {
    /// Remote endpoint for outbound links, the notional local endpoint the
    /// originator dialled for inbound links
    pub remote: PeerAddress,
    /// Frames to send, in order
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames received, in order
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl FramedLink {
    /// Two connected ends of an in-memory link
    ///
    /// The first end sees `remote_of_first` as its remote and the second end
    /// sees `remote_of_second`.
    #[must_use]
    pub fn pair(remote_of_first: PeerAddress, remote_of_second: PeerAddress) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                remote: remote_of_first,
                outgoing: a_tx,
                incoming: b_rx,
            },
            Self {
                remote: remote_of_second,
                outgoing: b_tx,
                incoming: a_rx,
            },
        )
    }
}

/// Opens outbound links
#[async_trait]
pub trait MessageTransport: Send + Sync + 'static {
    /// Connect to `target`
    ///
    /// # Errors
    ///
    /// Returns [`crate::ProxyError::Transport`] if the target is unreachable.
    async fn connect(&self, target: &PeerAddress) -> Result<FramedLink>;
}
