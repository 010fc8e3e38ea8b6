//! Echo plugin: the smallest useful command plugin.
//!
//! `say` writes its arguments back; `tick` streams numbered lines until
//! the request is cancelled, which makes it the standard way to exercise
//! cancellation and streaming in tests and demos.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use spindle_core::plugin::{
    CommandInput, CommandOutput, CommandPlugin, CommandStyle, Plugin, PluginContext, PluginError,
    PluginKind,
};
use tokio::io::AsyncWriteExt;

/// Registry id of this plugin.
pub const PLUGIN_ID: &str = "echo";

const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

/// Optional plugin configuration (`<config_dir>/echo.yml`).
#[derive(Debug, Default, Deserialize)]
struct EchoConfig {
    /// Milliseconds between `tick` lines.
    tick_interval_ms: Option<u64>,
}

/// Command plugin writing its input back to the caller.
pub struct EchoPlugin {
    tick_interval_ms: AtomicU64,
}

impl EchoPlugin {
    /// Create the plugin with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tick_interval_ms: AtomicU64::new(DEFAULT_TICK_INTERVAL_MS),
        }
    }
}

impl Default for EchoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for EchoPlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Echo"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Command
    }

    async fn init(&self, _ctx: &PluginContext, config: &[u8]) -> Result<(), PluginError> {
        if config.is_empty() {
            return Ok(());
        }
        let parsed: EchoConfig = serde_yaml::from_slice(config)
            .map_err(|e| PluginError::Failed(format!("invalid echo config: {e}")))?;
        if let Some(interval) = parsed.tick_interval_ms {
            self.tick_interval_ms.store(interval.max(1), Ordering::Relaxed);
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl CommandPlugin for EchoPlugin {
    fn commands(&self) -> Vec<String> {
        vec!["say".to_string(), "tick".to_string()]
    }

    fn command_style(&self) -> CommandStyle {
        CommandStyle::OneShot
    }

    async fn execute(
        &self,
        ctx: &PluginContext,
        argv: &[String],
        _input: CommandInput,
        mut output: CommandOutput,
    ) -> Result<(), PluginError> {
        let command = argv.first().map(String::as_str).unwrap_or_default();
        match command {
            "say" => {
                let line = format!("{}\n", argv[1..].join(" "));
                output.write_all(line.as_bytes()).await?;
                output.flush().await?;
                Ok(())
            },
            "tick" => {
                let interval =
                    Duration::from_millis(self.tick_interval_ms.load(Ordering::Relaxed));
                let mut n: u64 = 0;
                loop {
                    n += 1;
                    output.write_all(format!("tick {n}\n").as_bytes()).await?;
                    output.flush().await?;
                    tokio::select! {
                        () = ctx.cancelled() => return Err(PluginError::Cancelled),
                        () = tokio::time::sleep(interval) => {},
                    }
                }
            },
            other => Err(PluginError::UnknownCommand {
                command: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use spindle_core::signal::ShutdownController;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn say_echoes_arguments() {
        let plugin = EchoPlugin::new();
        let (mut rd, wr) = tokio::io::duplex(1024);

        let argv = vec!["say".to_string(), "hello".to_string(), "world".to_string()];
        plugin
            .execute(
                &PluginContext::detached(),
                &argv,
                Box::new(tokio::io::empty()),
                Box::new(wr),
            )
            .await
            .unwrap();

        let mut out = String::new();
        rd.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world\n");
    }

    #[tokio::test]
    async fn tick_streams_until_cancelled() {
        let plugin = EchoPlugin::new();
        let controller = ShutdownController::new();
        let ctx = PluginContext::new(controller.signal());
        let (mut rd, wr) = tokio::io::duplex(4096);

        let exec = tokio::spawn(async move {
            plugin
                .execute(
                    &ctx,
                    &["tick".to_string()],
                    Box::new(tokio::io::empty()),
                    Box::new(wr),
                )
                .await
        });

        // At least one line must arrive before we cancel.
        let mut buf = [0u8; 64];
        let n = rd.read(&mut buf).await.unwrap();
        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("tick 1"));

        controller.trigger();
        let result = exec.await.unwrap();
        assert!(matches!(result, Err(PluginError::Cancelled)));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let plugin = EchoPlugin::new();
        let (_rd, wr) = tokio::io::duplex(64);
        let result = plugin
            .execute(
                &PluginContext::detached(),
                &["shout".to_string()],
                Box::new(tokio::io::empty()),
                Box::new(wr),
            )
            .await;
        assert!(matches!(result, Err(PluginError::UnknownCommand { .. })));
    }

    #[tokio::test]
    async fn init_reads_interval_from_config() {
        let plugin = EchoPlugin::new();
        plugin
            .init(&PluginContext::detached(), b"tick_interval_ms: 5\n")
            .await
            .unwrap();
        assert_eq!(plugin.tick_interval_ms.load(Ordering::Relaxed), 5);

        assert!(plugin
            .init(&PluginContext::detached(), b"tick_interval_ms: {bad")
            .await
            .is_err());
    }
}
