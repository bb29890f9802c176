//! # Reload Orchestrator
//!
//! Store hooks only signal that a reload is needed. The orchestrator owns the receiving side of a
//! capacity-1 channel, so any number of signals between two checks collapse into one pending
//! reload. On every tick a pending reload is built off the async workers with `spawn_blocking` and
//! swapped into the [`ActiveTable`].
//!
//! A build that panics is contained by the blocking task: the join error is logged and the table
//! that was serving before stays in place.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::context::GatewayContext;
use crate::core::error::{GatewayError, GatewayResult};
use crate::routing::{RouteBuilder, RoutingTable};
use crate::store::{Event, EventHook};

/// The table serving traffic together with the facts that change with it
#[derive(Debug)]
pub struct ServingState {
    pub table: RoutingTable,
    /// Incremented on every swap; `0` is the empty table installed at startup
    pub generation: u64,
    pub built_at: DateTime<Utc>,
}

/// The live routing table
///
/// Readers load the current `Arc` without taking a lock and keep serving from that snapshot even
/// if a swap happens while they are in flight. Writers are serialized so generations never repeat.
#[derive(Debug)]
pub struct ActiveTable {
    current: ArcSwap<ServingState>,
    swapping: parking_lot::Mutex<()>,
}

impl Default for ActiveTable {
    fn default() -> Self {
        Self::new(RoutingTable::new())
    }
}

impl ActiveTable {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(ServingState {
                table,
                generation: 0,
                built_at: Utc::now(),
            }),
            swapping: parking_lot::Mutex::new(()),
        }
    }

    /// Snapshot used for one request
    pub fn load(&self) -> Arc<ServingState> {
        self.current.load_full()
    }

    /// Install a new table; returns its generation
    pub fn swap(&self, table: RoutingTable) -> u64 {
        let _guard = self.swapping.lock();
        let generation = self.current.load().generation + 1;
        self.current.store(Arc::new(ServingState {
            table,
            generation,
            built_at: Utc::now(),
        }));
        generation
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }
}

/// Store hook turning routing-relevant changes into a pending reload
#[derive(Debug, Clone)]
pub struct ReloadHook {
    sender: mpsc::Sender<()>,
}

impl ReloadHook {
    pub const NAME: &'static str = "reload";
}

impl EventHook for ReloadHook {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_event(&self, event: &Event) {
        match self.sender.try_send(()) {
            Ok(()) => debug!(key = %event.key_str(), "Reload requested"),
            Err(TrySendError::Full(())) => {
                debug!(key = %event.key_str(), "Reload already pending");
            }
            Err(TrySendError::Closed(())) => {
                warn!(key = %event.key_str(), "Reload orchestrator is gone, change not applied");
            }
        }
    }
}

pub struct ReloadOrchestrator {
    builder: RouteBuilder,
    active: Arc<ActiveTable>,
    pending: mpsc::Receiver<()>,
    check_interval: Duration,
    reloading: Mutex<()>,
}

impl ReloadOrchestrator {
    /// The orchestrator and the hook to register on the store
    pub fn new(ctx: &GatewayContext, active: Arc<ActiveTable>) -> (Self, ReloadHook) {
        let (sender, pending) = mpsc::channel(1);
        let orchestrator = Self {
            builder: RouteBuilder::new(ctx.clone()),
            active,
            pending,
            check_interval: ctx.settings.reload.check_interval,
            reloading: Mutex::new(()),
        };
        (orchestrator, ReloadHook { sender })
    }

    /// Build and install a new table now
    ///
    /// On failure the serving table is left untouched.
    pub async fn reload(&self) -> GatewayResult<u64> {
        let _guard = self.reloading.lock().await;
        info!("Reloading routing table");

        let builder = self.builder.clone();
        let table = tokio::task::spawn_blocking(move || builder.build())
            .await
            .map_err(|e| {
                counter!("reload_failures_total").increment(1);
                let reason = if e.is_panic() { "panicked" } else { "was cancelled" };
                error!(error = %e, "Routing table build {}, keeping the previous table", reason);
                GatewayError::internal(format!("routing table build {}: {}", reason, e))
            })?;

        let routes = table.route_count();
        let generation = self.active.swap(table);
        counter!("reloads_total").increment(1);
        info!(generation, routes, "Routing table swapped");
        Ok(generation)
    }

    /// Check for pending reloads on every tick until shutdown
    ///
    /// The first tick fires immediately.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(check_interval = ?self.check_interval, "Reload orchestrator started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reload orchestrator stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.pending.try_recv() {
                        Ok(()) => {
                            // a failed build is already logged and leaves the old table serving
                            let _ = self.reload().await;
                        }
                        Err(TryRecvError::Empty) => debug!("No reload pending"),
                        Err(TryRecvError::Disconnected) => {
                            warn!("Reload hook dropped, orchestrator stopping");
                            return;
                        }
                    }
                }
            }
        }
    }
}
