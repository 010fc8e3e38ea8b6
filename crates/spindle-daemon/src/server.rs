//! Server lifecycle: accept loop, shared state, graceful shutdown.
//!
//! [`Server::start`] binds the configured TCP address and spawns one
//! connection task per accepted socket. [`Server::stop`] triggers the
//! server-wide shutdown signal (which cascades into every connection and
//! every in-flight request), then waits for all connection tasks to drain
//! before stopping services and cleaning up plugins. Stop is idempotent.
//!
//! Worker completion is tracked with the channel-as-waitgroup idiom: each
//! connection task owns a clone of a completion sender, and `stop` awaits
//! the receiver until every clone has dropped.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spindle_core::auth::{AuthError, AuthManager, Client};
use spindle_core::config::ServerConfig;
use spindle_core::plugin::PluginRegistry;
use spindle_core::signal::{ShutdownController, ShutdownSignal};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::connection;

/// Interval between expired-session sweeps.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Errors produced by server startup.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A required directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        /// The directory that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that was attempted.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// `start` was called twice.
    #[error("server already started")]
    AlreadyStarted,
}

/// State shared by every connection and request worker.
pub struct ServerShared {
    /// Credential and session store.
    pub auth: Arc<AuthManager>,
    /// Plugin registry.
    pub plugins: Arc<PluginRegistry>,
    /// Server options.
    pub settings: ServerConfig,
}

/// The connection server.
pub struct Server {
    shared: Arc<ServerShared>,
    shutdown: ShutdownController,
    /// Held until `stop`; its drop lets the waitgroup drain.
    completion_tx: Option<mpsc::Sender<()>>,
    completion_rx: Option<mpsc::Receiver<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create a server over an existing plugin registry.
    ///
    /// Creates the plugins and config directories if missing, mirroring
    /// how deployments ship empty trees.
    ///
    /// # Errors
    ///
    /// Fails with [`ServerError::CreateDir`].
    pub fn new(settings: ServerConfig, plugins: Arc<PluginRegistry>) -> Result<Self, ServerError> {
        for dir in [&settings.plugins_dir, &settings.config_dir] {
            std::fs::create_dir_all(dir).map_err(|source| ServerError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        let auth = Arc::new(AuthManager::with_session_ttl(chrono::Duration::seconds(
            settings.session_ttl_secs,
        )));

        // Plugin-owned activity (service tasks, init contexts) is bounded
        // by this server's lifetime.
        let shutdown = ShutdownController::new();
        plugins.set_host_signal(shutdown.signal());

        Ok(Self {
            shared: Arc::new(ServerShared {
                auth,
                plugins,
                settings,
            }),
            shutdown,
            completion_tx: None,
            completion_rx: None,
            local_addr: None,
        })
    }

    /// The credential and session store.
    #[must_use]
    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.shared.auth
    }

    /// The plugin registry.
    #[must_use]
    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.shared.plugins
    }

    /// A shutdown signal bounded by this server's lifetime.
    ///
    /// Plugin init contexts derive from this so service activities end
    /// with the server.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Register a client from configuration.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::ClientExists`] on a duplicate id.
    pub fn register_client(&self, client: Client) -> Result<(), AuthError> {
        self.shared.auth.add_client(client)
    }

    /// Revoke a client and all of its sessions.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::UnknownClient`].
    pub fn revoke_client(&self, client_id: &str) -> Result<(), AuthError> {
        self.shared.auth.remove_client(client_id)
    }

    /// The bound address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and begin accepting connections.
    ///
    /// Returns the bound address (useful with port 0 in tests).
    ///
    /// # Errors
    ///
    /// Fails with [`ServerError::Bind`] or [`ServerError::AlreadyStarted`].
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if self.completion_rx.is_some() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = self.shared.settings.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.shared.settings.listen_addr(),
            source,
        })?;
        self.local_addr = Some(local_addr);

        let (completion_tx, completion_rx) = mpsc::channel::<()>(1);
        self.completion_rx = Some(completion_rx);
        self.completion_tx = Some(completion_tx.clone());

        // Lazy expiry is enough for correctness; the sweep bounds memory
        // growth under session churn.
        tokio::spawn(sweep_sessions(
            Arc::clone(&self.shared.auth),
            self.shutdown.signal(),
        ));

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            self.shutdown.clone(),
            completion_tx,
        ));

        info!(addr = %local_addr, "server started");
        Ok(local_addr)
    }

    /// Graceful shutdown: cancel everything, wait for workers, stop
    /// services, clean up plugins. Safe to call more than once.
    pub async fn stop(&mut self) {
        self.shutdown.trigger();
        self.completion_tx.take();

        if let Some(mut completion_rx) = self.completion_rx.take() {
            // Resolves once every connection task has dropped its sender.
            while completion_rx.recv().await.is_some() {}
            self.shared.plugins.shutdown().await;
            info!("server stopped");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    shutdown: ShutdownController,
    completion_tx: mpsc::Sender<()>,
) {
    let signal = shutdown.signal();
    loop {
        tokio::select! {
            () = signal.cancelled() => {
                debug!("accept loop stopping");
                break;
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    let conn_shutdown = shutdown.signal();
                    let permit = completion_tx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        connection::handle_connection(stream, peer, shared, conn_shutdown).await;
                    });
                },
                Err(e) => {
                    // A failing listener cannot make progress; degrade to
                    // a graceful shutdown rather than spin.
                    error!(error = %e, "accept failed, shutting down");
                    shutdown.trigger();
                    break;
                },
            },
        }
    }
    // The accept loop's own permit drops here, joining the waitgroup.
    drop(completion_tx);
}

async fn sweep_sessions(auth: Arc<AuthManager>, signal: ShutdownSignal) {
    let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = signal.cancelled() => break,
            _ = ticker.tick() => {
                let purged = auth.purge_expired();
                if purged > 0 {
                    debug!(purged, "swept expired sessions");
                }
            },
        }
    }
}
