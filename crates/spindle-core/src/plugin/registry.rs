//! Plugin registry: hosts plugin instances and enforces lifecycle state.
//!
//! The registry owns the `plugin_id → entry` map behind one reader/writer
//! lock. Mutations (register, unload, enable, disable, upgrade, service
//! transitions) hold the exclusive lock for the whole operation; lookups
//! clone the handle out under the shared lock so plugin calls never run
//! with the lock held. Command execution itself is driven by the
//! dispatcher, against handles obtained here.
//!
//! State transition graph, enforced here rather than in plugin code:
//!
//! ```text
//! disabled <──> enabled ──> running <──> paused
//!                  ▲           │
//!                  └───────────┘  (stop)
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{
    CommandPlugin, Plugin, PluginContext, PluginError, PluginHandle, PluginKind, PluginMetadata,
    PluginState, ServicePlugin,
};
use crate::signal::ShutdownSignal;

/// Snapshot of one registry entry, for listing and inspection.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    /// The manifest the plugin was registered with.
    pub metadata: PluginMetadata,
    /// Current lifecycle state.
    pub state: PluginState,
    /// Commands served, for command plugins.
    pub commands: Option<Vec<String>>,
}

struct PluginEntry {
    handle: PluginHandle,
    metadata: PluginMetadata,
    state: PluginState,
}

impl PluginEntry {
    fn info(&self) -> PluginInfo {
        PluginInfo {
            metadata: self.metadata.clone(),
            state: self.state,
            commands: self.handle.as_command().map(|p| p.commands()),
        }
    }
}

/// Thread-safe plugin registry.
///
/// Plugin `init`, `start`, and `restart` run under a host-scoped context:
/// their lifetime is the host's, not the lifetime of whichever request
/// happened to drive the transition. Command `execute` contexts are the
/// dispatcher's concern and are request-scoped.
pub struct PluginRegistry {
    inner: RwLock<HashMap<String, PluginEntry>>,
    config_dir: PathBuf,
    /// Signal bounding plugin-owned background activity. Defaults to
    /// never-fires; the server installs its own at startup.
    host_signal: std::sync::RwLock<ShutdownSignal>,
}

impl PluginRegistry {
    /// Create an empty registry reading plugin configs from `config_dir`.
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            config_dir: config_dir.into(),
            host_signal: std::sync::RwLock::new(ShutdownSignal::never()),
        }
    }

    /// Install the host shutdown signal bounding plugin lifetimes.
    pub fn set_host_signal(&self, signal: ShutdownSignal) {
        *self
            .host_signal
            .write()
            .expect("host signal lock poisoned") = signal;
    }

    /// Context handed to plugin lifecycle calls.
    fn host_context(&self) -> PluginContext {
        PluginContext::new(
            self.host_signal
                .read()
                .expect("host signal lock poisoned")
                .clone(),
        )
    }

    /// Register a plugin instance under its manifest.
    ///
    /// Reads `<config_dir>/<plugin_id>.yml` (if present) and passes the
    /// bytes to the plugin's `init`. New plugins start disabled.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::AlreadyExists`] on an id collision,
    /// [`PluginError::TypeMismatch`] when the manifest kind disagrees with
    /// the instance, or the plugin's own init error.
    pub async fn register(
        &self,
        metadata: PluginMetadata,
        handle: PluginHandle,
    ) -> Result<(), PluginError> {
        let mut inner = self.inner.write().await;
        self.register_locked(&mut inner, metadata, handle).await
    }

    /// Unload a plugin: cleanup, then removal.
    ///
    /// Running services must be stopped first; the registry does not stop
    /// them implicitly. A failing cleanup leaves the entry registered.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::InvalidState`]
    /// for a running service, or the plugin's cleanup error.
    pub async fn unload(&self, id: &str) -> Result<(), PluginError> {
        let mut inner = self.inner.write().await;
        let entry = inner.get(id).ok_or_else(|| PluginError::NotFound {
            id: id.to_string(),
        })?;

        if entry.state == PluginState::Running {
            return Err(PluginError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                operation: "unload",
            });
        }

        entry.handle.cleanup().await?;
        inner.remove(id);
        debug!(plugin = id, "plugin unloaded");
        Ok(())
    }

    /// Enable a disabled plugin.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`] or, when the plugin is not
    /// disabled, [`PluginError::AlreadyEnabled`].
    pub async fn enable(&self, id: &str) -> Result<(), PluginError> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(id).ok_or_else(|| PluginError::NotFound {
            id: id.to_string(),
        })?;
        if entry.state != PluginState::Disabled {
            return Err(PluginError::AlreadyEnabled {
                id: id.to_string(),
            });
        }
        entry.state = PluginState::Enabled;
        debug!(plugin = id, "plugin enabled");
        Ok(())
    }

    /// Disable a plugin from any state.
    ///
    /// A running service is stopped first; a failing stop leaves the
    /// state unchanged and is reported, not hidden.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::AlreadyDisabled`],
    /// or the service's stop error.
    pub async fn disable(&self, id: &str) -> Result<(), PluginError> {
        let mut inner = self.inner.write().await;
        let entry = inner.get_mut(id).ok_or_else(|| PluginError::NotFound {
            id: id.to_string(),
        })?;

        match entry.state {
            PluginState::Disabled => Err(PluginError::AlreadyDisabled {
                id: id.to_string(),
            }),
            PluginState::Running | PluginState::Paused => {
                let service = entry.handle.as_service().ok_or_else(|| {
                    // A command plugin can never reach running/paused.
                    PluginError::InvalidState {
                        id: id.to_string(),
                        state: entry.state,
                        operation: "disable",
                    }
                })?;
                service.stop().await?;
                entry.state = PluginState::Disabled;
                debug!(plugin = id, "service stopped and plugin disabled");
                Ok(())
            },
            PluginState::Enabled => {
                entry.state = PluginState::Disabled;
                debug!(plugin = id, "plugin disabled");
                Ok(())
            },
        }
    }

    /// Replace a plugin with a new instance at the same id.
    ///
    /// Unload plus register under one exclusive lock. If registering the
    /// replacement fails the registry is left without the plugin; the old
    /// handle is not restored.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::InvalidState`]
    /// for a running service, or the replacement's init error.
    pub async fn upgrade(
        &self,
        metadata: PluginMetadata,
        handle: PluginHandle,
    ) -> Result<(), PluginError> {
        let id = metadata.id.clone();
        let mut inner = self.inner.write().await;

        let entry = inner.get(&id).ok_or_else(|| PluginError::NotFound {
            id: id.clone(),
        })?;
        if entry.state == PluginState::Running {
            return Err(PluginError::InvalidState {
                id,
                state: entry.state,
                operation: "upgrade",
            });
        }

        let old = inner.remove(&id).expect("entry checked above");
        if let Err(e) = old.handle.cleanup().await {
            warn!(plugin = %id, error = %e, "cleanup of old plugin failed during upgrade");
        }

        self.register_locked(&mut inner, metadata, handle).await
    }

    /// Look up a plugin handle.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`].
    pub async fn get(&self, id: &str) -> Result<PluginHandle, PluginError> {
        let inner = self.inner.read().await;
        inner
            .get(id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| PluginError::NotFound {
                id: id.to_string(),
            })
    }

    /// Current lifecycle state of a plugin.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`].
    pub async fn state(&self, id: &str) -> Result<PluginState, PluginError> {
        let inner = self.inner.read().await;
        inner
            .get(id)
            .map(|entry| entry.state)
            .ok_or_else(|| PluginError::NotFound {
                id: id.to_string(),
            })
    }

    /// Snapshot of one entry.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`].
    pub async fn info(&self, id: &str) -> Result<PluginInfo, PluginError> {
        let inner = self.inner.read().await;
        inner
            .get(id)
            .map(PluginEntry::info)
            .ok_or_else(|| PluginError::NotFound {
                id: id.to_string(),
            })
    }

    /// Snapshot of all entries, ordered by id.
    pub async fn list(&self) -> Vec<PluginInfo> {
        let inner = self.inner.read().await;
        let mut infos: Vec<PluginInfo> = inner.values().map(PluginEntry::info).collect();
        infos.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        infos
    }

    /// Typed lookup of a command plugin, regardless of state.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`] or [`PluginError::TypeMismatch`].
    pub async fn command_plugin(&self, id: &str) -> Result<Arc<dyn CommandPlugin>, PluginError> {
        let inner = self.inner.read().await;
        let entry = inner.get(id).ok_or_else(|| PluginError::NotFound {
            id: id.to_string(),
        })?;
        entry
            .handle
            .as_command()
            .ok_or_else(|| PluginError::TypeMismatch {
                id: id.to_string(),
                expected: PluginKind::Command,
                actual: entry.handle.kind(),
            })
    }

    /// Typed lookup of a service plugin, regardless of state.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`] or [`PluginError::TypeMismatch`].
    pub async fn service_plugin(&self, id: &str) -> Result<Arc<dyn ServicePlugin>, PluginError> {
        let inner = self.inner.read().await;
        let entry = inner.get(id).ok_or_else(|| PluginError::NotFound {
            id: id.to_string(),
        })?;
        entry
            .handle
            .as_service()
            .ok_or_else(|| PluginError::TypeMismatch {
                id: id.to_string(),
                expected: PluginKind::Service,
                actual: entry.handle.kind(),
            })
    }

    /// Resolve a command plugin for dispatch: kind and state are both
    /// checked, so a disabled plugin is never executed.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::TypeMismatch`],
    /// or [`PluginError::InvalidState`] when the plugin is not enabled.
    pub async fn resolve_command(&self, id: &str) -> Result<Arc<dyn CommandPlugin>, PluginError> {
        let inner = self.inner.read().await;
        let entry = inner.get(id).ok_or_else(|| PluginError::NotFound {
            id: id.to_string(),
        })?;
        let plugin = entry
            .handle
            .as_command()
            .ok_or_else(|| PluginError::TypeMismatch {
                id: id.to_string(),
                expected: PluginKind::Command,
                actual: entry.handle.kind(),
            })?;
        match entry.state {
            PluginState::Enabled | PluginState::Running => Ok(plugin),
            state => Err(PluginError::InvalidState {
                id: id.to_string(),
                state,
                operation: "execute",
            }),
        }
    }

    /// Start a service plugin's activity (`enabled → running`).
    ///
    /// The activity runs under the host context: it outlives the request
    /// that started it and ends with the server.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::TypeMismatch`],
    /// [`PluginError::InvalidState`], or the plugin's start error. A
    /// failing start leaves the state unchanged.
    pub async fn start_service(&self, id: &str) -> Result<(), PluginError> {
        let ctx = self.host_context();
        let mut inner = self.inner.write().await;
        let entry = Self::service_entry_mut(&mut inner, id)?;
        if entry.state != PluginState::Enabled {
            return Err(PluginError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                operation: "start",
            });
        }
        let service = entry.handle.as_service().expect("kind checked above");
        service.start(&ctx).await?;
        entry.state = PluginState::Running;
        debug!(plugin = id, "service started");
        Ok(())
    }

    /// Stop a service plugin's activity (`running|paused → enabled`).
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::TypeMismatch`],
    /// [`PluginError::InvalidState`], or the plugin's stop error.
    pub async fn stop_service(&self, id: &str) -> Result<(), PluginError> {
        let mut inner = self.inner.write().await;
        let entry = Self::service_entry_mut(&mut inner, id)?;
        if !matches!(entry.state, PluginState::Running | PluginState::Paused) {
            return Err(PluginError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                operation: "stop",
            });
        }
        let service = entry.handle.as_service().expect("kind checked above");
        service.stop().await?;
        entry.state = PluginState::Enabled;
        debug!(plugin = id, "service stopped");
        Ok(())
    }

    /// Restart a running service without leaving the running state.
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::TypeMismatch`],
    /// [`PluginError::InvalidState`], or the plugin's restart error.
    pub async fn restart_service(&self, id: &str) -> Result<(), PluginError> {
        let ctx = self.host_context();
        let mut inner = self.inner.write().await;
        let entry = Self::service_entry_mut(&mut inner, id)?;
        if entry.state != PluginState::Running {
            return Err(PluginError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                operation: "restart",
            });
        }
        let service = entry.handle.as_service().expect("kind checked above");
        service.restart(&ctx).await?;
        debug!(plugin = id, "service restarted");
        Ok(())
    }

    /// Pause a running service (`running → paused`).
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::TypeMismatch`],
    /// [`PluginError::InvalidState`], or the plugin's pause error.
    pub async fn pause_service(&self, id: &str) -> Result<(), PluginError> {
        let mut inner = self.inner.write().await;
        let entry = Self::service_entry_mut(&mut inner, id)?;
        if entry.state != PluginState::Running {
            return Err(PluginError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                operation: "pause",
            });
        }
        let service = entry.handle.as_service().expect("kind checked above");
        service.pause().await?;
        entry.state = PluginState::Paused;
        debug!(plugin = id, "service paused");
        Ok(())
    }

    /// Resume a paused service (`paused → running`).
    ///
    /// # Errors
    ///
    /// Fails with [`PluginError::NotFound`], [`PluginError::TypeMismatch`],
    /// [`PluginError::InvalidState`], or the plugin's resume error.
    pub async fn resume_service(&self, id: &str) -> Result<(), PluginError> {
        let mut inner = self.inner.write().await;
        let entry = Self::service_entry_mut(&mut inner, id)?;
        if entry.state != PluginState::Paused {
            return Err(PluginError::InvalidState {
                id: id.to_string(),
                state: entry.state,
                operation: "resume",
            });
        }
        let service = entry.handle.as_service().expect("kind checked above");
        service.resume().await?;
        entry.state = PluginState::Running;
        debug!(plugin = id, "service resumed");
        Ok(())
    }

    /// Number of registered plugins.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the registry holds no plugins.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Stop all active services and clean up every plugin.
    ///
    /// Used on server shutdown; failures are logged, not propagated, so
    /// one misbehaving plugin cannot wedge the rest.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.write().await;
        for entry in inner.values_mut() {
            if matches!(entry.state, PluginState::Running | PluginState::Paused) {
                if let Some(service) = entry.handle.as_service() {
                    if let Err(e) = service.stop().await {
                        warn!(plugin = %entry.metadata.id, error = %e, "service stop failed during shutdown");
                    }
                }
                entry.state = PluginState::Enabled;
            }
        }
        for (id, entry) in inner.drain() {
            if let Err(e) = entry.handle.cleanup().await {
                warn!(plugin = %id, error = %e, "plugin cleanup failed during shutdown");
            }
        }
    }

    async fn register_locked(
        &self,
        inner: &mut HashMap<String, PluginEntry>,
        metadata: PluginMetadata,
        handle: PluginHandle,
    ) -> Result<(), PluginError> {
        let id = metadata.id.clone();

        if metadata.kind != handle.kind() {
            return Err(PluginError::TypeMismatch {
                id,
                expected: metadata.kind,
                actual: handle.kind(),
            });
        }
        if inner.contains_key(&id) {
            return Err(PluginError::AlreadyExists { id });
        }

        let config = self.load_plugin_config(&id)?;
        handle.init(&self.host_context(), &config).await?;

        debug!(plugin = %id, kind = %metadata.kind, "plugin registered");
        inner.insert(
            id,
            PluginEntry {
                handle,
                metadata,
                state: PluginState::Disabled,
            },
        );
        Ok(())
    }

    /// Read `<config_dir>/<plugin_id>.yml`, empty when absent.
    fn load_plugin_config(&self, id: &str) -> Result<Vec<u8>, PluginError> {
        let path = self.config_dir.join(format!("{id}.yml"));
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn service_entry_mut<'a>(
        inner: &'a mut HashMap<String, PluginEntry>,
        id: &str,
    ) -> Result<&'a mut PluginEntry, PluginError> {
        let entry = inner.get_mut(id).ok_or_else(|| PluginError::NotFound {
            id: id.to_string(),
        })?;
        if entry.handle.kind() != PluginKind::Service {
            return Err(PluginError::TypeMismatch {
                id: id.to_string(),
                expected: PluginKind::Service,
                actual: entry.handle.kind(),
            });
        }
        Ok(entry)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("config_dir", &self.config_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::plugin::{CommandInput, CommandOutput, CommandStyle};

    fn metadata(id: &str, kind: PluginKind) -> PluginMetadata {
        PluginMetadata {
            id: id.to_string(),
            name: id.to_string(),
            version: "1.0.0".to_string(),
            kind,
            description: None,
            author: None,
            dependencies: Vec::new(),
        }
    }

    #[derive(Default)]
    struct FakeCommand {
        init_calls: AtomicUsize,
        cleanup_calls: AtomicUsize,
        init_config: std::sync::Mutex<Vec<u8>>,
        fail_init: bool,
    }

    #[async_trait]
    impl Plugin for FakeCommand {
        fn id(&self) -> &str {
            "fake"
        }
        fn name(&self) -> &str {
            "Fake"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn kind(&self) -> PluginKind {
            PluginKind::Command
        }
        async fn init(&self, _ctx: &PluginContext, config: &[u8]) -> Result<(), PluginError> {
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            *self.init_config.lock().unwrap() = config.to_vec();
            if self.fail_init {
                return Err(PluginError::Failed("init exploded".to_string()));
            }
            Ok(())
        }
        async fn cleanup(&self) -> Result<(), PluginError> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl CommandPlugin for FakeCommand {
        fn commands(&self) -> Vec<String> {
            vec!["noop".to_string()]
        }
        fn command_style(&self) -> CommandStyle {
            CommandStyle::OneShot
        }
        async fn execute(
            &self,
            _ctx: &PluginContext,
            _argv: &[String],
            _input: CommandInput,
            _output: CommandOutput,
        ) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeService {
        stop_calls: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for FakeService {
        fn id(&self) -> &str {
            "svc"
        }
        fn name(&self) -> &str {
            "Svc"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn kind(&self) -> PluginKind {
            PluginKind::Service
        }
        async fn init(&self, _ctx: &PluginContext, _config: &[u8]) -> Result<(), PluginError> {
            Ok(())
        }
        async fn cleanup(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ServicePlugin for FakeService {
        async fn start(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
        async fn stop(&self) -> Result<(), PluginError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn restart(&self, _ctx: &PluginContext) -> Result<(), PluginError> {
            Ok(())
        }
        async fn pause(&self) -> Result<(), PluginError> {
            Ok(())
        }
        async fn resume(&self) -> Result<(), PluginError> {
            Ok(())
        }
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new("nonexistent-config-dir")
    }

    #[tokio::test]
    async fn register_initializes_and_starts_disabled() {
        let reg = registry();
        let plugin = Arc::new(FakeCommand::default());
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(plugin.clone()),
        )
        .await
        .unwrap();

        assert_eq!(plugin.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.state("fake").await.unwrap(), PluginState::Disabled);
    }

    #[tokio::test]
    async fn register_passes_config_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fake.yml"), "greeting: hi\n").unwrap();

        let reg = PluginRegistry::new(dir.path());
        let plugin = Arc::new(FakeCommand::default());
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(plugin.clone()),
        )
        .await
        .unwrap();

        assert_eq!(&*plugin.init_config.lock().unwrap(), b"greeting: hi\n");
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let reg = registry();
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(Arc::new(FakeCommand::default())),
        )
        .await
        .unwrap();

        let err = reg
            .register(
                metadata("fake", PluginKind::Command),
                PluginHandle::Command(Arc::new(FakeCommand::default())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn metadata_kind_must_match_instance() {
        let reg = registry();
        let err = reg
            .register(
                metadata("fake", PluginKind::Service),
                PluginHandle::Command(Arc::new(FakeCommand::default())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn failed_init_does_not_register() {
        let reg = registry();
        let plugin = Arc::new(FakeCommand {
            fail_init: true,
            ..FakeCommand::default()
        });
        let err = reg
            .register(
                metadata("fake", PluginKind::Command),
                PluginHandle::Command(plugin),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Failed(_)));
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn enable_disable_transitions() {
        let reg = registry();
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(Arc::new(FakeCommand::default())),
        )
        .await
        .unwrap();

        reg.enable("fake").await.unwrap();
        assert_eq!(reg.state("fake").await.unwrap(), PluginState::Enabled);
        assert!(matches!(
            reg.enable("fake").await,
            Err(PluginError::AlreadyEnabled { .. })
        ));

        reg.disable("fake").await.unwrap();
        assert_eq!(reg.state("fake").await.unwrap(), PluginState::Disabled);
        assert!(matches!(
            reg.disable("fake").await,
            Err(PluginError::AlreadyDisabled { .. })
        ));
    }

    #[tokio::test]
    async fn service_lifecycle_follows_graph() {
        let reg = registry();
        let service = Arc::new(FakeService::default());
        reg.register(
            metadata("svc", PluginKind::Service),
            PluginHandle::Service(service.clone()),
        )
        .await
        .unwrap();

        // Cannot start while disabled.
        assert!(matches!(
            reg.start_service("svc").await,
            Err(PluginError::InvalidState { .. })
        ));

        reg.enable("svc").await.unwrap();
        reg.start_service("svc").await.unwrap();
        assert_eq!(reg.state("svc").await.unwrap(), PluginState::Running);

        // Running: no double start, no resume.
        assert!(matches!(
            reg.start_service("svc").await,
            Err(PluginError::InvalidState { .. })
        ));
        assert!(matches!(
            reg.resume_service("svc").await,
            Err(PluginError::InvalidState { .. })
        ));

        reg.pause_service("svc").await.unwrap();
        assert_eq!(reg.state("svc").await.unwrap(), PluginState::Paused);
        reg.resume_service("svc").await.unwrap();
        assert_eq!(reg.state("svc").await.unwrap(), PluginState::Running);

        reg.restart_service("svc").await.unwrap();
        assert_eq!(reg.state("svc").await.unwrap(), PluginState::Running);

        reg.stop_service("svc").await.unwrap();
        assert_eq!(reg.state("svc").await.unwrap(), PluginState::Enabled);
        assert_eq!(service.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disable_stops_running_service_exactly_once() {
        let reg = registry();
        let service = Arc::new(FakeService::default());
        reg.register(
            metadata("svc", PluginKind::Service),
            PluginHandle::Service(service.clone()),
        )
        .await
        .unwrap();

        reg.enable("svc").await.unwrap();
        reg.start_service("svc").await.unwrap();
        reg.disable("svc").await.unwrap();

        assert_eq!(service.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(reg.state("svc").await.unwrap(), PluginState::Disabled);
    }

    #[tokio::test]
    async fn unload_requires_stopped_service() {
        let reg = registry();
        reg.register(
            metadata("svc", PluginKind::Service),
            PluginHandle::Service(Arc::new(FakeService::default())),
        )
        .await
        .unwrap();
        reg.enable("svc").await.unwrap();
        reg.start_service("svc").await.unwrap();

        assert!(matches!(
            reg.unload("svc").await,
            Err(PluginError::InvalidState { .. })
        ));

        reg.stop_service("svc").await.unwrap();
        reg.unload("svc").await.unwrap();
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn unload_calls_cleanup() {
        let reg = registry();
        let plugin = Arc::new(FakeCommand::default());
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(plugin.clone()),
        )
        .await
        .unwrap();

        reg.unload("fake").await.unwrap();
        assert_eq!(plugin.cleanup_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            reg.unload("fake").await,
            Err(PluginError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn typed_getters_check_kind() {
        let reg = registry();
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(Arc::new(FakeCommand::default())),
        )
        .await
        .unwrap();

        assert!(reg.command_plugin("fake").await.is_ok());
        assert!(matches!(
            reg.service_plugin("fake").await,
            Err(PluginError::TypeMismatch { .. })
        ));
        assert!(matches!(
            reg.command_plugin("ghost").await,
            Err(PluginError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn resolve_command_gates_on_state() {
        let reg = registry();
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(Arc::new(FakeCommand::default())),
        )
        .await
        .unwrap();

        assert!(matches!(
            reg.resolve_command("fake").await,
            Err(PluginError::InvalidState { .. })
        ));
        reg.enable("fake").await.unwrap();
        assert!(reg.resolve_command("fake").await.is_ok());
    }

    #[tokio::test]
    async fn upgrade_swaps_instance_and_failure_leaves_gap() {
        let reg = registry();
        let old = Arc::new(FakeCommand::default());
        reg.register(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(old.clone()),
        )
        .await
        .unwrap();

        // Successful upgrade cleans up the old instance.
        let replacement = Arc::new(FakeCommand::default());
        reg.upgrade(
            metadata("fake", PluginKind::Command),
            PluginHandle::Command(replacement.clone()),
        )
        .await
        .unwrap();
        assert_eq!(old.cleanup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(replacement.init_calls.load(Ordering::SeqCst), 1);

        // Failed upgrade leaves the registry without the plugin.
        let broken = Arc::new(FakeCommand {
            fail_init: true,
            ..FakeCommand::default()
        });
        let err = reg
            .upgrade(
                metadata("fake", PluginKind::Command),
                PluginHandle::Command(broken),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Failed(_)));
        assert!(matches!(
            reg.get("fake").await,
            Err(PluginError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_services_and_clears() {
        let reg = registry();
        let service = Arc::new(FakeService::default());
        reg.register(
            metadata("svc", PluginKind::Service),
            PluginHandle::Service(service.clone()),
        )
        .await
        .unwrap();
        reg.enable("svc").await.unwrap();
        reg.start_service("svc").await.unwrap();

        reg.shutdown().await;
        assert_eq!(service.stop_calls.load(Ordering::SeqCst), 1);
        assert!(reg.is_empty().await);
    }
}
