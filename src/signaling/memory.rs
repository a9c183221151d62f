//! In-process signaling broker

use super::{SignalingChannel, SignalingMessage};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// In-memory signaling broker
///
/// Fans every sent message out to all live subscribers of the session,
/// including the sender's own subscription (hosted pub/sub transports echo
/// broadcasts the same way; receivers filter by `sender_id`). Messages sent
/// while a session has no subscribers are dropped, matching the best-effort
/// contract.
#[derive(Debug, Default, Clone)]
pub struct MemorySignaling {
    sessions: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<SignalingMessage>>>>>,
}

impl MemorySignaling {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers for a session
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .get(session_id)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        debug!(session_id, "signaling subscriber added");
        Ok(rx)
    }

    async fn send(&self, session_id: &str, message: SignalingMessage) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let Some(subscribers) = sessions.get_mut(session_id) else {
            trace!(session_id, kind = message.kind(), "no subscribers, message dropped");
            return Ok(());
        };

        let mut delivered = 0usize;
        subscribers.retain(|tx| match tx.send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            // Receiver dropped: unsubscribe.
            Err(_) => false,
        });

        trace!(
            session_id,
            kind = message.kind(),
            delivered,
            "signaling message fanned out"
        );
        Ok(())
    }
}
