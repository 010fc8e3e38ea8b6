//! Compile-time plugin factories and metadata-driven loading.
//!
//! Plugins are compiled into the daemon; the set loaded at startup is
//! declared by `*.yml` manifests in the plugins directory. Each manifest
//! id must match a factory here. Unknown ids are logged and skipped so a
//! stale manifest cannot prevent startup.

pub mod chat;
pub mod echo;
pub mod manager;
pub mod pulse;

use std::path::Path;
use std::sync::Arc;

use spindle_core::plugin::{PluginError, PluginHandle, PluginRegistry, discover_metadata};
use tracing::{info, warn};

/// Instantiate a built-in plugin by id.
///
/// Returns `None` for ids with no compiled-in factory.
#[must_use]
pub fn instantiate(id: &str, registry: &Arc<PluginRegistry>) -> Option<PluginHandle> {
    match id {
        echo::PLUGIN_ID => Some(PluginHandle::Command(Arc::new(echo::EchoPlugin::new()))),
        chat::PLUGIN_ID => Some(PluginHandle::Command(Arc::new(chat::ChatPlugin::new()))),
        pulse::PLUGIN_ID => Some(PluginHandle::Service(Arc::new(pulse::PulsePlugin::new()))),
        manager::PLUGIN_ID => Some(PluginHandle::Command(Arc::new(manager::ManagerPlugin::new(
            Arc::downgrade(registry),
        )))),
        _ => None,
    }
}

/// Scan the plugins directory and register every declared plugin.
///
/// Registered plugins are enabled immediately, matching how deployments
/// expect a declared plugin to be usable after startup. Per-plugin
/// failures are logged, not fatal.
///
/// # Errors
///
/// Fails only when the directory scan itself fails (unreadable directory
/// or malformed manifest).
pub async fn load_declared_plugins(
    plugins_dir: &Path,
    registry: &Arc<PluginRegistry>,
) -> Result<usize, PluginError> {
    let manifests = discover_metadata(plugins_dir)?;
    let mut loaded = 0usize;

    for metadata in manifests {
        let id = metadata.id.clone();
        let Some(handle) = instantiate(&id, registry) else {
            warn!(plugin = %id, "manifest declares a plugin with no compiled-in factory, skipping");
            continue;
        };

        match registry.register(metadata, handle).await {
            Ok(()) => {
                if let Err(e) = registry.enable(&id).await {
                    warn!(plugin = %id, error = %e, "failed to enable plugin");
                    continue;
                }
                info!(plugin = %id, "plugin loaded and enabled");
                loaded += 1;
            },
            Err(e) => {
                warn!(plugin = %id, error = %e, "failed to register plugin");
            },
        }
    }

    Ok(loaded)
}
