//! Outbound handle for one connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use uuid::Uuid;

/// Logical role of a frame's sender or receiver, as shown to monitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    Client,
    Agent,
    Voice,
    Assistant,
    Monitor,
    Server,
}

impl PeerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerRole::Client => "client",
            PeerRole::Agent => "agent",
            PeerRole::Voice => "voice",
            PeerRole::Assistant => "assistant",
            PeerRole::Monitor => "monitor",
            PeerRole::Server => "server",
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The queue stayed full past the write deadline.
    Timeout,
    /// The connection's writer is gone.
    Closed,
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendFailure::Timeout => f.write_str("write deadline exceeded"),
            SendFailure::Closed => f.write_str("connection closed"),
        }
    }
}

/// Sender side of a connection's outbound queue.
///
/// Cloning shares the queue; identity is the connection id, not the clone.
#[derive(Debug, Clone)]
pub struct Peer {
    id: Uuid,
    tx: mpsc::Sender<Arc<Vec<u8>>>,
}

impl Peer {
    pub fn new(tx: mpsc::Sender<Arc<Vec<u8>>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    /// A peer plus the receiving end its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Arc<Vec<u8>>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue `frame`, waiting at most `deadline` for space.
    pub async fn send(&self, frame: Arc<Vec<u8>>, deadline: Duration) -> Result<(), SendFailure> {
        self.tx
            .send_timeout(frame, deadline)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SendFailure::Timeout,
                SendTimeoutError::Closed(_) => SendFailure::Closed,
            })
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}
