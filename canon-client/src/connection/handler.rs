//! Outgoing message handle

use canon_protocol::ClientMessage;
use canon_utils::{CanonError, Result};
use tokio::sync::mpsc;

/// Clonable message sender bound to one transport link
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<ClientMessage>,
}

impl MessageSender {
    pub fn new(tx: mpsc::Sender<ClientMessage>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| CanonError::ConnectionClosed)
    }

    /// Whether the link behind this sender is gone
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
