//! # Config Feed
//!
//! Source of configuration change events. A feed answers a one-shot fetch of the complete current
//! state (used at startup, before streaming) and then pushes ordered put/delete events into the
//! store's event channel.

pub mod standalone;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::error::GatewayResult;
use crate::store::{Event, EventPool, PooledEvent};

pub use standalone::StandaloneFeed;

#[async_trait]
pub trait ConfigFeed: Send + Sync {
    /// Every existing resource as a put event
    async fn fetch_all(&self) -> GatewayResult<Vec<Event>>;

    /// Push change events into `sender`, in order, until shutdown or the receiver goes away
    ///
    /// Changes made after the last `fetch_all` but before the watch is established are emitted
    /// first, so nothing is lost between the two calls.
    async fn watch(
        &self,
        pool: EventPool,
        sender: mpsc::Sender<PooledEvent>,
        shutdown: CancellationToken,
    ) -> GatewayResult<()>;
}
