//! Core domain logic for the spindle plugin host.
//!
//! This crate holds everything the connection server needs that is not
//! network I/O:
//!
//! - [`config`]: JSON configuration model and loading
//! - [`crypto`]: the symmetric body cipher keyed per client
//! - [`auth`]: credential store, HMAC challenge authentication, sessions,
//!   permission checks
//! - [`plugin`]: the plugin contract (traits, metadata, lifecycle states)
//!   and the registry that hosts plugin instances
//! - [`signal`]: cooperative shutdown signalling shared by the server,
//!   connections, and in-flight plugin calls
//!
//! The daemon crate (`spindle-daemon`) layers the wire protocol and the
//! connection state machine on top of these types.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod plugin;
pub mod signal;

pub use auth::{AuthError, AuthManager, Client, Permission, Session};
pub use config::{AppConfig, ConfigError, ServerConfig};
pub use crypto::{CipherMode, CryptoError, XxteaCipher};
pub use plugin::{
    CommandPlugin, CommandStyle, Plugin, PluginContext, PluginError, PluginHandle, PluginKind,
    PluginMetadata, PluginRegistry, PluginState, ServicePlugin,
};
pub use signal::{ShutdownController, ShutdownSignal};
