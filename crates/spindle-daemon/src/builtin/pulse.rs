//! Pulse plugin: a minimal service plugin.
//!
//! The service is a background ticker counting beats. It is deliberately
//! small; its job is to exercise the full service lifecycle
//! (start/stop/pause/resume/restart) end to end, including cooperative
//! shutdown through the host context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use spindle_core::plugin::{Plugin, PluginContext, PluginError, PluginKind, ServicePlugin};
use spindle_core::signal::ShutdownController;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

/// Registry id of this plugin.
pub const PLUGIN_ID: &str = "pulse";

const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Optional plugin configuration (`<config_dir>/pulse.yml`).
#[derive(Debug, Default, Deserialize)]
struct PulseConfig {
    /// Milliseconds between beats.
    interval_ms: Option<u64>,
}

struct Activity {
    stop: ShutdownController,
    handle: JoinHandle<()>,
}

/// Service plugin running a background beat counter.
pub struct PulsePlugin {
    interval_ms: AtomicU64,
    beats: Arc<AtomicU64>,
    paused: Arc<AtomicBool>,
    activity: Mutex<Option<Activity>>,
}

impl PulsePlugin {
    /// Create the plugin with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interval_ms: AtomicU64::new(DEFAULT_INTERVAL_MS),
            beats: Arc::new(AtomicU64::new(0)),
            paused: Arc::new(AtomicBool::new(false)),
            activity: Mutex::new(None),
        }
    }

    /// Beats counted since the service last started.
    #[must_use]
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

impl Default for PulsePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for PulsePlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Pulse"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Service
    }

    async fn init(&self, _ctx: &PluginContext, config: &[u8]) -> Result<(), PluginError> {
        if config.is_empty() {
            return Ok(());
        }
        let parsed: PulseConfig = serde_yaml::from_slice(config)
            .map_err(|e| PluginError::Failed(format!("invalid pulse config: {e}")))?;
        if let Some(interval) = parsed.interval_ms {
            self.interval_ms.store(interval.max(1), Ordering::Relaxed);
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        // Unload while running is rejected by the registry, but cleanup
        // still sweeps up a leftover activity rather than leak the task.
        let activity = self.activity.lock().await.take();
        if let Some(activity) = activity {
            activity.stop.trigger();
            let _ = activity.handle.await;
        }
        Ok(())
    }
}

#[async_trait]
impl ServicePlugin for PulsePlugin {
    async fn start(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        let mut activity = self.activity.lock().await;
        if activity.is_some() {
            return Err(PluginError::Failed("pulse activity already running".to_string()));
        }

        self.beats.store(0, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);

        let stop = ShutdownController::new();
        let stop_signal = stop.signal();
        let host_signal = ctx.shutdown().clone();
        let beats = Arc::clone(&self.beats);
        let paused = Arc::clone(&self.paused);
        let interval = Duration::from_millis(self.interval_ms.load(Ordering::Relaxed));

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop_signal.cancelled() => break,
                    () = host_signal.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        if !paused.load(Ordering::Relaxed) {
                            let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
                            trace!(beat = n, "pulse");
                        }
                    },
                }
            }
        });

        *activity = Some(Activity { stop, handle });
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        let activity = self.activity.lock().await.take();
        let Some(activity) = activity else {
            return Err(PluginError::Failed("pulse activity is not running".to_string()));
        };
        activity.stop.trigger();
        activity
            .handle
            .await
            .map_err(|e| PluginError::Failed(format!("pulse activity task failed: {e}")))?;
        Ok(())
    }

    async fn restart(&self, ctx: &PluginContext) -> Result<(), PluginError> {
        self.stop().await?;
        self.start(ctx).await
    }

    async fn pause(&self) -> Result<(), PluginError> {
        self.paused.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn resume(&self) -> Result<(), PluginError> {
        self.paused.store(false, Ordering::Relaxed);
        Ok(())
    }
}
