//! Out-of-band signaling
//!
//! The call engine exchanges offers, answers, candidates, and presence over
//! an abstract duplex channel keyed by session id. Production deployments
//! implement [`SignalingChannel`] on top of their hosted transport;
//! [`MemorySignaling`] is the in-process reference implementation used by
//! tests and local development.

mod memory;
mod protocol;

pub use memory::MemorySignaling;
pub use protocol::{PresenceStatus, SignalingMessage, SignalingPayload};

use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Abstract duplex signaling transport
///
/// Delivery is best-effort and at-most-once; ordering is only guaranteed per
/// message type. Dropping the receiver returned by [`subscribe`] is the
/// unsubscribe operation.
///
/// [`subscribe`]: SignalingChannel::subscribe
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Begin receiving messages for a session
    async fn subscribe(
        &self,
        session_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>>;

    /// Send a message to every subscriber of a session
    ///
    /// Failures surface as [`crate::Error::SignalingSendFailed`]; callers
    /// that consider a send transient wrap it in a
    /// [`crate::RetryPolicy`].
    async fn send(&self, session_id: &str, message: SignalingMessage) -> Result<()>;
}
