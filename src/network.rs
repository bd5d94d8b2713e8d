//! Boundary to the external ledger network client (gateway connection,
//! identity, consensus decoding and reconnection all live on the other side).
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::DeliveryError;
use crate::event::BlockEvent;

/// Per-channel ordered block deliveries. An `Err` item is a transient
/// delivery error; the stream keeps going after it.
pub type BlockStream = BoxStream<'static, Result<BlockEvent, DeliveryError>>;

/// Handle returned by a subscription. Dropping it does *not* unsubscribe.
pub trait ListenerHandle: Send + Sync {
    /// Stop deliveries for this subscription. Must be idempotent.
    fn unsubscribe(&self);
}

/// A live block subscription on one channel.
pub struct Subscription {
    pub events: BlockStream,
    pub handle: Box<dyn ListenerHandle>,
}

/// Ledger network client consumed by the sync engine.
#[async_trait]
pub trait LedgerNetwork: Send + Sync {
    /// Connect and authenticate against the network.
    async fn connect(&self) -> anyhow::Result<()>;

    /// Subscribe to block events of `channel`, starting at block `start`.
    async fn subscribe(&self, channel: &str, start: u64) -> anyhow::Result<Subscription>;

    /// Release the network connection.
    async fn disconnect(&self) {}
}
