//! Chat plugin: an interactive line relay.
//!
//! `relay` copies stdin lines back to stdout until the caller closes its
//! side of the stream. It exists to exercise the interactive command
//! path: `DATA_STREAM` frames in, `DATA_STREAM` frames out, terminal
//! response when the stream ends.

use async_trait::async_trait;
use spindle_core::plugin::{
    CommandInput, CommandOutput, CommandPlugin, CommandStyle, Plugin, PluginContext, PluginError,
    PluginKind,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Registry id of this plugin.
pub const PLUGIN_ID: &str = "chat";

/// Interactive command plugin relaying lines.
#[derive(Default)]
pub struct ChatPlugin;

impl ChatPlugin {
    /// Create the plugin.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for ChatPlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Chat"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Command
    }

    async fn init(&self, _ctx: &PluginContext, _config: &[u8]) -> Result<(), PluginError> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), PluginError> {
        Ok(())
    }
}

#[async_trait]
impl CommandPlugin for ChatPlugin {
    fn commands(&self) -> Vec<String> {
        vec!["relay".to_string()]
    }

    fn command_style(&self) -> CommandStyle {
        CommandStyle::Interactive
    }

    async fn execute(
        &self,
        ctx: &PluginContext,
        argv: &[String],
        input: CommandInput,
        mut output: CommandOutput,
    ) -> Result<(), PluginError> {
        let command = argv.first().map(String::as_str).unwrap_or_default();
        if command != "relay" {
            return Err(PluginError::UnknownCommand {
                command: command.to_string(),
            });
        }

        let mut lines = BufReader::new(input).lines();
        loop {
            let line = tokio::select! {
                () = ctx.cancelled() => return Err(PluginError::Cancelled),
                line = lines.next_line() => line?,
            };
            match line {
                Some(line) => {
                    output.write_all(line.as_bytes()).await?;
                    output.write_all(b"\n").await?;
                    output.flush().await?;
                },
                // Caller closed its side: a clean end of the stream.
                None => return Ok(()),
            }
        }
    }
}
