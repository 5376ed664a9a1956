//! Liveness monitor: periodic eviction sweeps.
//!
//! Every second the monitor closes (1) connections that never registered
//! within the register timeout and (2) bound slots whose heartbeat went
//! silent past the heartbeat timeout.  Closing goes through the transport's
//! close channel, so the eventual `on_closed` callback performs the actual
//! slot release.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::{Duration, interval};
use tracing::debug;

use crate::engine::Engine;

pub(crate) async fn monitor_loop(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Instant::now();
                engine.sweep_unregistered(now);
                engine.sweep_heartbeats(now);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("monitor stopping");
                    return;
                }
            }
        }
    }
}
