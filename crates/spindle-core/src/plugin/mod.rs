//! Plugin contract: traits, metadata, lifecycle states.
//!
//! A plugin is a named, typed extension hosted by the daemon. Command
//! plugins expose discrete commands executed per request over async
//! stdin/stdout streams; service plugins own a long-running background
//! activity with start/stop/pause/resume transitions.
//!
//! Plugins are compiled in and instantiated through a factory table; the
//! set loaded at startup is driven by declarative `*.yml` metadata files
//! in the plugins directory. Lifecycle state lives in the registry record
//! and is enforced by the host around every plugin call; implementations
//! never manage their own state.

mod registry;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use registry::{PluginInfo, PluginRegistry};

use crate::signal::ShutdownSignal;

/// Input stream handed to a command execution.
pub type CommandInput = Box<dyn AsyncRead + Send + Unpin>;

/// Output stream handed to a command execution.
pub type CommandOutput = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors produced by the plugin registry and plugin implementations.
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin registered under the given id.
    #[error("plugin not found: {id}")]
    NotFound {
        /// Requested plugin id.
        id: String,
    },

    /// A plugin with the same id is already registered.
    #[error("plugin already exists: {id}")]
    AlreadyExists {
        /// Conflicting plugin id.
        id: String,
    },

    /// Enable requested on a plugin that is not disabled.
    #[error("plugin already enabled: {id}")]
    AlreadyEnabled {
        /// Plugin id.
        id: String,
    },

    /// Disable requested on a plugin that is already disabled.
    #[error("plugin already disabled: {id}")]
    AlreadyDisabled {
        /// Plugin id.
        id: String,
    },

    /// The plugin exists but is of the wrong kind for the operation.
    #[error("plugin {id} is a {actual} plugin, not a {expected} plugin")]
    TypeMismatch {
        /// Plugin id.
        id: String,
        /// Kind the operation required.
        expected: PluginKind,
        /// Kind actually registered.
        actual: PluginKind,
    },

    /// The operation is not allowed in the plugin's current state.
    #[error("plugin {id} cannot {operation} while {state}")]
    InvalidState {
        /// Plugin id.
        id: String,
        /// Current lifecycle state.
        state: PluginState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// A declared command the plugin does not implement.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The command that was requested.
        command: String,
    },

    /// The execution was interrupted by cancellation.
    #[error("command cancelled")]
    Cancelled,

    /// Plugin metadata could not be parsed.
    #[error("invalid plugin metadata: {0}")]
    Metadata(String),

    /// Arbitrary plugin failure.
    #[error("{0}")]
    Failed(String),

    /// I/O failure inside a plugin or the registry.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Plugin kind discriminant.
///
/// Serialized as `0` (service) / `1` (command) in metadata files for
/// compatibility with existing plugin manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PluginKind {
    /// Long-running background activity.
    Service,
    /// Discrete request-scoped commands.
    Command,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Command => write!(f, "command"),
        }
    }
}

impl TryFrom<u8> for PluginKind {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Service),
            1 => Ok(Self::Command),
            other => Err(format!("unknown plugin kind: {other}")),
        }
    }
}

impl From<PluginKind> for u8 {
    fn from(value: PluginKind) -> Self {
        match value {
            PluginKind::Service => 0,
            PluginKind::Command => 1,
        }
    }
}

/// How a command plugin consumes input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStyle {
    /// Reads optional stdin once and writes output to completion.
    OneShot,
    /// Expects a bidirectional stream until the caller closes.
    Interactive,
}

/// Plugin lifecycle state, owned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    /// Registered but unavailable for dispatch.
    Disabled,
    /// Available for dispatch; services may be started.
    Enabled,
    /// Service activity is running (service plugins only).
    Running,
    /// Service activity is paused (service plugins only).
    Paused,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Enabled => write!(f, "enabled"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
        }
    }
}

/// Declarative plugin manifest, one `<plugin>.yml` per plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// Unique plugin id; must match a compiled-in factory.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Plugin kind (`0` = service, `1` = command).
    #[serde(rename = "type")]
    pub kind: PluginKind,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Ids of plugins this plugin depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl PluginMetadata {
    /// Parse a metadata manifest from YAML bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::Metadata`] on malformed YAML or an
    /// empty id.
    pub fn from_yaml(bytes: &[u8]) -> Result<Self, PluginError> {
        let metadata: Self =
            serde_yaml::from_slice(bytes).map_err(|e| PluginError::Metadata(e.to_string()))?;
        if metadata.id.is_empty() {
            return Err(PluginError::Metadata("plugin id cannot be empty".to_string()));
        }
        Ok(metadata)
    }
}

/// Scan a directory for `*.yml` plugin manifests.
///
/// Missing directories yield an empty set; unparseable manifests are
/// errors so a typo does not silently drop a plugin.
///
/// # Errors
///
/// Fails on directory read errors or malformed manifests.
pub fn discover_metadata(dir: &Path) -> Result<Vec<PluginMetadata>, PluginError> {
    let mut manifests = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(manifests),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let path = entry?.path();
        let is_manifest = path
            .extension()
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if !is_manifest {
            continue;
        }
        let bytes = std::fs::read(&path)?;
        let metadata = PluginMetadata::from_yaml(&bytes)
            .map_err(|e| PluginError::Metadata(format!("{}: {e}", path.display())))?;
        manifests.push(metadata);
    }

    // Stable order keeps startup logs and dependency handling deterministic.
    manifests.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(manifests)
}

/// Context handed to every plugin call.
///
/// Carries a cooperative shutdown signal bounded by the caller's request
/// lifetime: connection close cancels in-flight commands, server shutdown
/// cancels everything. Long-running plugin operations must observe it.
#[derive(Debug, Clone)]
pub struct PluginContext {
    shutdown: ShutdownSignal,
}

impl PluginContext {
    /// Build a context observing the given signal.
    #[must_use]
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self { shutdown }
    }

    /// A context that is never cancelled (tests, detached init).
    #[must_use]
    pub fn detached() -> Self {
        Self {
            shutdown: ShutdownSignal::never(),
        }
    }

    /// The shutdown signal bounding this call.
    #[must_use]
    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Resolve once the caller's lifetime ends.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await;
    }

    /// Whether the caller's lifetime has already ended.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Common plugin surface.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin id.
    fn id(&self) -> &str;

    /// Display name.
    fn name(&self) -> &str;

    /// Version string.
    fn version(&self) -> &str;

    /// Plugin kind.
    fn kind(&self) -> PluginKind;

    /// Initialize with optional config bytes from the config directory.
    async fn init(&self, ctx: &PluginContext, config: &[u8]) -> Result<(), PluginError>;

    /// Release resources before unload.
    async fn cleanup(&self) -> Result<(), PluginError>;
}

/// A plugin exposing discrete commands.
#[async_trait]
pub trait CommandPlugin: Plugin {
    /// Commands this plugin serves.
    fn commands(&self) -> Vec<String>;

    /// Input style of this plugin's commands.
    fn command_style(&self) -> CommandStyle;

    /// Execute `argv[0]` with arguments `argv[1..]`.
    ///
    /// Output written to `output` is streamed to the caller in order;
    /// `input` ends when the caller closes its side. Implementations must
    /// return promptly once `ctx` is cancelled.
    async fn execute(
        &self,
        ctx: &PluginContext,
        argv: &[String],
        input: CommandInput,
        output: CommandOutput,
    ) -> Result<(), PluginError>;
}

/// A plugin owning a long-running background activity.
#[async_trait]
pub trait ServicePlugin: Plugin {
    /// Start the activity. Called only in the enabled state.
    async fn start(&self, ctx: &PluginContext) -> Result<(), PluginError>;

    /// Stop the activity. Called in the running or paused state.
    async fn stop(&self) -> Result<(), PluginError>;

    /// Stop and start again without leaving the running state.
    async fn restart(&self, ctx: &PluginContext) -> Result<(), PluginError>;

    /// Suspend the activity without releasing it.
    async fn pause(&self) -> Result<(), PluginError>;

    /// Resume a paused activity.
    async fn resume(&self) -> Result<(), PluginError>;
}

/// A registered plugin instance, typed by kind.
#[derive(Clone)]
pub enum PluginHandle {
    /// Command plugin instance.
    Command(Arc<dyn CommandPlugin>),
    /// Service plugin instance.
    Service(Arc<dyn ServicePlugin>),
}

impl PluginHandle {
    /// The instance's id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Command(p) => p.id(),
            Self::Service(p) => p.id(),
        }
    }

    /// The instance's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Command(p) => p.name(),
            Self::Service(p) => p.name(),
        }
    }

    /// The instance's version.
    #[must_use]
    pub fn version(&self) -> &str {
        match self {
            Self::Command(p) => p.version(),
            Self::Service(p) => p.version(),
        }
    }

    /// The instance's kind, from the handle shape itself.
    #[must_use]
    pub fn kind(&self) -> PluginKind {
        match self {
            Self::Command(_) => PluginKind::Command,
            Self::Service(_) => PluginKind::Service,
        }
    }

    /// Initialize the underlying plugin.
    ///
    /// # Errors
    ///
    /// Propagates the plugin's init error.
    pub async fn init(&self, ctx: &PluginContext, config: &[u8]) -> Result<(), PluginError> {
        match self {
            Self::Command(p) => p.init(ctx, config).await,
            Self::Service(p) => p.init(ctx, config).await,
        }
    }

    /// Clean up the underlying plugin.
    ///
    /// # Errors
    ///
    /// Propagates the plugin's cleanup error.
    pub async fn cleanup(&self) -> Result<(), PluginError> {
        match self {
            Self::Command(p) => p.cleanup().await,
            Self::Service(p) => p.cleanup().await,
        }
    }

    /// The command instance, if this is a command plugin.
    #[must_use]
    pub fn as_command(&self) -> Option<Arc<dyn CommandPlugin>> {
        match self {
            Self::Command(p) => Some(Arc::clone(p)),
            Self::Service(_) => None,
        }
    }

    /// The service instance, if this is a service plugin.
    #[must_use]
    pub fn as_service(&self) -> Option<Arc<dyn ServicePlugin>> {
        match self {
            Self::Service(p) => Some(Arc::clone(p)),
            Self::Command(_) => None,
        }
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_parses_numeric_kind() {
        let yaml = b"id: echo\nname: Echo\nversion: 1.0.0\ntype: 1\ndescription: test plugin\n";
        let metadata = PluginMetadata::from_yaml(yaml).unwrap();
        assert_eq!(metadata.id, "echo");
        assert_eq!(metadata.kind, PluginKind::Command);
        assert_eq!(metadata.description.as_deref(), Some("test plugin"));
        assert!(metadata.dependencies.is_empty());

        let yaml = b"id: pulse\nname: Pulse\nversion: 0.1.0\ntype: 0\n";
        assert_eq!(
            PluginMetadata::from_yaml(yaml).unwrap().kind,
            PluginKind::Service
        );
    }

    #[test]
    fn metadata_rejects_unknown_kind_and_empty_id() {
        let yaml = b"id: x\nname: X\nversion: 1.0\ntype: 7\n";
        assert!(PluginMetadata::from_yaml(yaml).is_err());

        let yaml = b"id: \"\"\nname: X\nversion: 1.0\ntype: 1\n";
        assert!(matches!(
            PluginMetadata::from_yaml(yaml),
            Err(PluginError::Metadata(_))
        ));
    }

    #[test]
    fn discover_metadata_scans_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("zeta.yml"),
            "id: zeta\nname: Z\nversion: 1.0\ntype: 1\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("alpha.yaml"),
            "id: alpha\nname: A\nversion: 1.0\ntype: 0\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a manifest").unwrap();

        let manifests = discover_metadata(dir.path()).unwrap();
        let ids: Vec<_> = manifests.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[test]
    fn discover_metadata_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(discover_metadata(&missing).unwrap().is_empty());
    }

    #[test]
    fn discover_metadata_bad_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yml"), "{{{{").unwrap();
        assert!(discover_metadata(dir.path()).is_err());
    }
}
