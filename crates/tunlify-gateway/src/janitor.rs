//! Background janitor
//!
//! Runs on a fixed cadence and enforces the retention caps: control
//! channels with no inbound activity past the staleness threshold are
//! closed (their session cleanup does the actual teardown), and pending
//! requests past the retention cap are forcibly failed.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::CloseReason;
use crate::AppState;

pub fn spawn_janitor(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(state.config.janitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; there is nothing to sweep
        // at startup.
        interval.tick().await;

        loop {
            interval.tick().await;

            let swept = state.pending.sweep(state.config.pending_max_age);

            let mut evicted = 0usize;
            for channel in state.registry.channels() {
                if channel.idle_for() >= state.config.stale_channel_after {
                    channel.close(CloseReason::Evicted);
                    evicted += 1;
                }
            }

            if swept > 0 || evicted > 0 {
                info!(
                    swept_requests = swept,
                    evicted_channels = evicted,
                    "janitor pass complete"
                );
            }
        }
    })
}
