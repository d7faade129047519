//! Background tasks: the eviction ticker and the gateway event loop.

use std::{sync::Arc, time::Duration};

use {
    arachne_common::time::now_secs,
    arachne_platform::GatewayEvent,
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

use crate::state::AppContext;

/// One monotonic ticker per process: sweeps expired queue messages and,
/// piggybacked, expired OAuth artifacts. Its period bounds worst-case
/// memory overhang to one interval past TTL.
pub fn spawn_eviction(ctx: Arc<AppContext>, cancel: CancellationToken) -> JoinHandle<()> {
    let period = Duration::from_secs(ctx.config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    ctx.bus.sweep();
                    if let Err(e) = ctx.registry.cleanup_expired_oauth(now_secs() as i64).await {
                        warn!(error = %e, "oauth artifact cleanup failed");
                    }
                },
            }
        }
    })
}

/// Consume gateway events in delivery order. Sequential awaiting is what
/// makes per-entity queue order equal gateway order; the router spawns its
/// own tasks for anything slow.
pub fn spawn_event_loop(
    ctx: Arc<AppContext>,
    mut events: mpsc::Receiver<GatewayEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => {
                    let Some(event) = event else { return };
                    if let Err(e) = ctx.router.handle_event(event).await {
                        warn!(error = %e, "event fan-out failed");
                    }
                },
            }
        }
    })
}
