//! # Sample Heartbeat Plugin
//!
//! Demonstrates a dynamically loaded plugin that uses every capability:
//!
//! - Lifecycle: logs on initialize and shutdown
//! - Service contribution: registers [`HeartbeatStats`] with the host
//! - Background work: a periodic heartbeat driven by [`ServiceTask`]
//!
//! Build it as a shared library and drop it into the host's plugin
//! directory:
//!
//! ```text
//! cargo build -p sample-plugin --release
//! cp target/release/libsample_plugin.so plugins/
//! plexus discover && plexus enable sample.heartbeat
//! ```

use async_trait::async_trait;
use plexus_plugin_api::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Identifier the plugin reports
pub const PLUGIN_ID: &str = "sample.heartbeat";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Heartbeat counters, shared with the host through the service registry
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    beats: AtomicU64,
}

impl HeartbeatStats {
    /// Heartbeats emitted so far
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    fn record(&self) -> u64 {
        self.beats.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Heartbeat plugin
#[derive(Debug)]
pub struct SamplePlugin {
    interval: Duration,
    stats: Arc<HeartbeatStats>,
}

impl Default for SamplePlugin {
    fn default() -> Self {
        Self::with_interval(DEFAULT_INTERVAL)
    }
}

impl SamplePlugin {
    /// Plugin emitting one heartbeat per `interval`
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            stats: Arc::new(HeartbeatStats::default()),
        }
    }

    /// Counters of this instance
    pub fn stats(&self) -> &Arc<HeartbeatStats> {
        &self.stats
    }
}

#[async_trait]
impl Plugin for SamplePlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Sample Heartbeat"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    async fn initialize(&mut self, ctx: PluginContext) -> plexus_plugin_api::Result<()> {
        if self.interval.is_zero() {
            return Err(PluginError::init("heartbeat interval must be > 0"));
        }
        info!(
            plugin = %ctx.plugin_id(),
            interval = ?self.interval,
            "Heartbeat plugin initialized"
        );
        Ok(())
    }

    async fn shutdown(&mut self, _cancel: CancellationToken) -> plexus_plugin_api::Result<()> {
        info!(beats = self.stats.beats(), "Heartbeat plugin shut down");
        Ok(())
    }

    fn as_service_contribution(&self) -> Option<&dyn ServiceContribution> {
        Some(self)
    }

    fn as_background_work(&self) -> Option<&dyn BackgroundWork> {
        Some(self)
    }
}

impl ServiceContribution for SamplePlugin {
    fn configure_services(&self, services: &ServiceRegistry) -> plexus_plugin_api::Result<()> {
        services.insert(Arc::clone(&self.stats));
        Ok(())
    }
}

impl BackgroundWork for SamplePlugin {
    fn background_tasks(&self) -> Vec<Box<dyn BackgroundTask>> {
        let heartbeat = Heartbeat {
            interval: self.interval,
            stats: Arc::clone(&self.stats),
        };
        vec![ServiceTask::new(heartbeat).boxed()]
    }
}

#[derive(Debug)]
struct Heartbeat {
    interval: Duration,
    stats: Arc<HeartbeatStats>,
}

#[async_trait]
impl BackgroundService for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn execute(&self, stopping: CancellationToken) -> plexus_plugin_api::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stopping.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let beat = self.stats.record();
                    debug!(beat, "Heartbeat");
                }
            }
        }
    }
}

plexus_plugin_api::declare_plexus_plugin!(SamplePlugin);
