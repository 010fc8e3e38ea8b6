//! Manager plugin: drives the plugin registry over the command protocol.
//!
//! Remote administration happens through the same plugin contract as
//! everything else: the manager is a command plugin whose commands
//! inspect and mutate the registry. It holds the registry weakly, since
//! the registry owns the manager and not the other way around.

use std::sync::Weak;

use async_trait::async_trait;
use spindle_core::plugin::{
    CommandInput, CommandOutput, CommandPlugin, CommandStyle, Plugin, PluginContext, PluginError,
    PluginKind, PluginRegistry,
};
use tokio::io::AsyncWriteExt;

/// Registry id of this plugin.
pub const PLUGIN_ID: &str = "manager";

/// Command plugin exposing registry administration.
pub struct ManagerPlugin {
    registry: Weak<PluginRegistry>,
}

impl ManagerPlugin {
    /// Create the plugin over a weak registry handle.
    #[must_use]
    pub fn new(registry: Weak<PluginRegistry>) -> Self {
        Self { registry }
    }

    fn registry(&self) -> Result<std::sync::Arc<PluginRegistry>, PluginError> {
        self.registry
            .upgrade()
            .ok_or_else(|| PluginError::Failed("plugin registry is gone".to_string()))
    }
}

fn required_arg<'a>(argv: &'a [String], index: usize, name: &str) -> Result<&'a str, PluginError> {
    argv.get(index)
        .map(String::as_str)
        .ok_or_else(|| PluginError::Failed(format!("missing argument: {name}")))
}

#[async_trait]
impl Plugin for ManagerPlugin {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn name(&self) -> &str {
        "Plugin Manager"
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
impl CommandPlugin for ManagerPlugin {
    fn commands(&self) -> Vec<String> {
        [
            "list", "info", "status", "enable", "disable", "unload", "upgrade", "start", "stop",
            "restart", "pause", "resume",
        ]
        .iter()
        .map(ToString::to_string)
        .collect()
    }

    fn command_style(&self) -> CommandStyle {
        CommandStyle::OneShot
    }

    async fn execute(
        &self,
        _ctx: &PluginContext,
        argv: &[String],
        _input: CommandInput,
        mut output: CommandOutput,
    ) -> Result<(), PluginError> {
        let registry = self.registry()?;
        let command = argv.first().map(String::as_str).unwrap_or_default();

        match command {
            "list" => {
                for info in registry.list().await {
                    let line = format!(
                        "{}\t{}\t{}\t{}\t{}\n",
                        info.metadata.id,
                        info.metadata.kind,
                        info.state,
                        info.metadata.version,
                        info.metadata.name,
                    );
                    output.write_all(line.as_bytes()).await?;
                }
            },
            "info" => {
                let id = required_arg(argv, 1, "plugin id")?;
                let info = registry.info(id).await?;
                let mut text = format!(
                    "id: {}\nname: {}\nversion: {}\nkind: {}\nstate: {}\n",
                    info.metadata.id,
                    info.metadata.name,
                    info.metadata.version,
                    info.metadata.kind,
                    info.state,
                );
                if let Some(description) = &info.metadata.description {
                    text.push_str(&format!("description: {description}\n"));
                }
                if let Some(author) = &info.metadata.author {
                    text.push_str(&format!("author: {author}\n"));
                }
                if !info.metadata.dependencies.is_empty() {
                    text.push_str(&format!(
                        "dependencies: {}\n",
                        info.metadata.dependencies.join(", ")
                    ));
                }
                if let Some(commands) = &info.commands {
                    text.push_str(&format!("commands: {}\n", commands.join(", ")));
                }
                output.write_all(text.as_bytes()).await?;
            },
            "status" => {
                let id = required_arg(argv, 1, "plugin id")?;
                let state = registry.state(id).await?;
                output.write_all(format!("{id}: {state}\n").as_bytes()).await?;
            },
            "enable" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.enable(id).await?;
                output.write_all(format!("{id} enabled\n").as_bytes()).await?;
            },
            "disable" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.disable(id).await?;
                output.write_all(format!("{id} disabled\n").as_bytes()).await?;
            },
            "unload" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.unload(id).await?;
                output.write_all(format!("{id} unloaded\n").as_bytes()).await?;
            },
            "upgrade" => {
                let id = required_arg(argv, 1, "plugin id")?;
                let info = registry.info(id).await?;
                let handle = super::instantiate(id, &registry).ok_or_else(|| {
                    PluginError::Failed(format!("no compiled-in factory for plugin: {id}"))
                })?;
                registry.upgrade(info.metadata, handle).await?;
                output.write_all(format!("{id} upgraded\n").as_bytes()).await?;
            },
            "start" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.start_service(id).await?;
                output.write_all(format!("{id} started\n").as_bytes()).await?;
            },
            "stop" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.stop_service(id).await?;
                output.write_all(format!("{id} stopped\n").as_bytes()).await?;
            },
            "restart" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.restart_service(id).await?;
                output.write_all(format!("{id} restarted\n").as_bytes()).await?;
            },
            "pause" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.pause_service(id).await?;
                output.write_all(format!("{id} paused\n").as_bytes()).await?;
            },
            "resume" => {
                let id = required_arg(argv, 1, "plugin id")?;
                registry.resume_service(id).await?;
                output.write_all(format!("{id} resumed\n").as_bytes()).await?;
            },
            other => {
                return Err(PluginError::UnknownCommand {
                    command: other.to_string(),
                });
            },
        }

        output.flush().await?;
        Ok(())
    }
}
