//! Credential and session store.
//!
//! Clients are registered from configuration with a shared secret and a
//! permission set. Authentication is an HMAC-SHA256 challenge over
//! `"<client_id>:<nonce>:<timestamp>"`; success mints a time-bounded
//! session. All state is in memory behind one reader/writer lock; lookups
//! hold the shared lock only for the duration of map access.
//!
//! # Replay protection
//!
//! The signature scheme alone limits replay to the timestamp tolerance
//! window. To close that gap the store additionally remembers recently
//! seen `(client_id, nonce)` pairs for the duration of the window, bounded
//! in size, and rejects a nonce it has already accepted.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

/// Default session lifetime.
const DEFAULT_SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// Accepted clock skew between client and server, in either direction.
const TIMESTAMP_TOLERANCE_SECS: i64 = 5 * 60;

/// Upper bound on remembered nonces. Entries expire with the timestamp
/// tolerance window; the cap only matters under a flood.
const MAX_SEEN_NONCES: usize = 8192;

/// Errors produced by authentication and session operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No client registered under the given id.
    #[error("client not found")]
    UnknownClient,

    /// A client with the same id is already registered.
    #[error("client already exists")]
    ClientExists,

    /// Signature mismatch.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// Timestamp outside the accepted window.
    #[error("timestamp expired")]
    TimestampExpired,

    /// The nonce was already accepted inside the tolerance window.
    #[error("nonce already used")]
    ReplayedNonce,

    /// No session with the given id.
    #[error("session not found")]
    SessionNotFound,

    /// The session exists but its expiry has passed.
    #[error("session expired")]
    SessionExpired,
}

/// A permission grant.
///
/// `PluginUse` is a wildcard superseding per-plugin grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    /// Manage the plugin registry (load, unload, enable, disable, upgrade).
    PluginManage,
    /// Manage service plugin lifecycles (start, stop, pause, resume).
    ServiceManage,
    /// Use any command plugin.
    PluginUse,
    /// Use one specific plugin.
    PluginScoped(String),
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PluginManage => write!(f, "plugin:manage"),
            Self::ServiceManage => write!(f, "service:manage"),
            Self::PluginUse => write!(f, "plugin:use"),
            Self::PluginScoped(id) => write!(f, "plugin:{id}:use"),
        }
    }
}

impl std::str::FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin:manage" => Ok(Self::PluginManage),
            "service:manage" => Ok(Self::ServiceManage),
            "plugin:use" => Ok(Self::PluginUse),
            other => {
                let scoped = other
                    .strip_prefix("plugin:")
                    .and_then(|rest| rest.strip_suffix(":use"))
                    .filter(|id| !id.is_empty() && !id.contains(':'));
                match scoped {
                    Some(id) => Ok(Self::PluginScoped(id.to_string())),
                    None => Err(format!("unrecognized permission: {other}")),
                }
            },
        }
    }
}

impl TryFrom<String> for Permission {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.to_string()
    }
}

/// A registered client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    /// Identity, unique per store.
    pub id: String,
    /// Shared secret: both the HMAC key and the body cipher key.
    pub secret: String,
    /// Display name.
    pub name: String,
    /// Granted permissions.
    #[serde(default)]
    pub permissions: Vec<Permission>,
}

/// An authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// 128-bit random id, rendered as text.
    pub id: String,
    /// Client that created the session.
    pub client_id: String,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Expiry instant.
    pub expires_at: DateTime<Utc>,
}

/// One remembered nonce.
#[derive(Debug)]
struct SeenNonce {
    client_id: String,
    nonce: String,
    seen_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    clients: HashMap<String, Client>,
    sessions: HashMap<String, Session>,
    /// Insertion-ordered, pruned from the front.
    seen_nonces: VecDeque<SeenNonce>,
}

/// Thread-safe credential and session store.
#[derive(Debug)]
pub struct AuthManager {
    inner: RwLock<Inner>,
    session_ttl: Duration,
}

impl AuthManager {
    /// Create a store with the default 24 h session lifetime.
    #[must_use]
    pub fn new() -> Self {
        Self::with_session_ttl(Duration::seconds(DEFAULT_SESSION_TTL_SECS))
    }

    /// Create a store with an explicit session lifetime.
    #[must_use]
    pub fn with_session_ttl(session_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            session_ttl,
        }
    }

    /// Register a client.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::ClientExists`] on a duplicate id.
    pub fn add_client(&self, client: Client) -> Result<(), AuthError> {
        let mut inner = self.inner.write().expect("auth store lock poisoned");
        if inner.clients.contains_key(&client.id) {
            return Err(AuthError::ClientExists);
        }
        inner.clients.insert(client.id.clone(), client);
        Ok(())
    }

    /// Remove a client and every session it created.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::UnknownClient`] if the id is not registered.
    pub fn remove_client(&self, client_id: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.write().expect("auth store lock poisoned");
        if inner.clients.remove(client_id).is_none() {
            return Err(AuthError::UnknownClient);
        }
        inner.sessions.retain(|_, s| s.client_id != client_id);
        Ok(())
    }

    /// Look up a client record by id.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::UnknownClient`] if the id is not registered.
    pub fn client(&self, client_id: &str) -> Result<Client, AuthError> {
        let inner = self.inner.read().expect("auth store lock poisoned");
        inner
            .clients
            .get(client_id)
            .cloned()
            .ok_or(AuthError::UnknownClient)
    }

    /// Authenticate a challenge and mint a session.
    ///
    /// The signature is `HMAC-SHA256(secret, "<client_id>:<nonce>:<timestamp>")`
    /// hex-encoded; comparison is constant-time. Timestamps outside
    /// ±5 minutes of server time are rejected, as are nonces replayed
    /// within that window.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnknownClient`], [`AuthError::InvalidCredentials`],
    /// [`AuthError::TimestampExpired`], or [`AuthError::ReplayedNonce`].
    pub fn authenticate(
        &self,
        client_id: &str,
        nonce: &str,
        timestamp: i64,
        signature: &str,
    ) -> Result<String, AuthError> {
        let mut inner = self.inner.write().expect("auth store lock poisoned");

        let client = inner
            .clients
            .get(client_id)
            .ok_or(AuthError::UnknownClient)?;

        let expected = sign_challenge(client.secret.as_bytes(), client_id, nonce, timestamp);
        if !constant_time_str_eq(&expected, signature) {
            return Err(AuthError::InvalidCredentials);
        }

        let now = Utc::now();
        let skew = (now.timestamp() - timestamp).abs();
        if skew > TIMESTAMP_TOLERANCE_SECS {
            return Err(AuthError::TimestampExpired);
        }

        remember_nonce(&mut inner, client_id, nonce, now)?;

        let session = Session {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            created_at: now,
            expires_at: now + self.session_ttl,
        };
        let session_id = session.id.clone();
        inner.sessions.insert(session_id.clone(), session);

        Ok(session_id)
    }

    /// Resolve a session to its client. Does not extend expiry.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SessionNotFound`], [`AuthError::SessionExpired`],
    /// or [`AuthError::UnknownClient`] when the creating client has been
    /// revoked out from under the session.
    pub fn validate_session(&self, session_id: &str) -> Result<Client, AuthError> {
        let inner = self.inner.read().expect("auth store lock poisoned");
        let session = inner
            .sessions
            .get(session_id)
            .ok_or(AuthError::SessionNotFound)?;
        if Utc::now() > session.expires_at {
            return Err(AuthError::SessionExpired);
        }
        inner
            .clients
            .get(&session.client_id)
            .cloned()
            .ok_or(AuthError::UnknownClient)
    }

    /// Revoke a single session.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::SessionNotFound`] if the id is unknown.
    pub fn revoke_session(&self, session_id: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.write().expect("auth store lock poisoned");
        inner
            .sessions
            .remove(session_id)
            .map(|_| ())
            .ok_or(AuthError::SessionNotFound)
    }

    /// Whether a client holds a specific permission.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::UnknownClient`] if the id is not registered.
    pub fn has_permission(&self, client_id: &str, permission: &Permission) -> Result<bool, AuthError> {
        let inner = self.inner.read().expect("auth store lock poisoned");
        let client = inner
            .clients
            .get(client_id)
            .ok_or(AuthError::UnknownClient)?;
        Ok(client.permissions.contains(permission))
    }

    /// Whether a client may use a specific plugin.
    ///
    /// `plugin:use` is a wildcard; otherwise a `plugin:<id>:use` grant is
    /// required.
    ///
    /// # Errors
    ///
    /// Fails with [`AuthError::UnknownClient`] if the id is not registered.
    pub fn has_plugin_permission(&self, client_id: &str, plugin_id: &str) -> Result<bool, AuthError> {
        let inner = self.inner.read().expect("auth store lock poisoned");
        let client = inner
            .clients
            .get(client_id)
            .ok_or(AuthError::UnknownClient)?;
        Ok(client.permissions.iter().any(|p| match p {
            Permission::PluginUse => true,
            Permission::PluginScoped(id) => id == plugin_id,
            _ => false,
        }))
    }

    /// Drop expired sessions, returning how many were removed.
    ///
    /// Validation already rejects expired sessions lazily; the sweep just
    /// bounds memory growth under churn.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write().expect("auth store lock poisoned");
        let now = Utc::now();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.expires_at >= now);
        before - inner.sessions.len()
    }

    /// Number of live session records (expired-but-unswept included).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner
            .read()
            .expect("auth store lock poisoned")
            .sessions
            .len()
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Record a nonce, rejecting replays inside the tolerance window.
fn remember_nonce(
    inner: &mut Inner,
    client_id: &str,
    nonce: &str,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    let horizon = now - Duration::seconds(TIMESTAMP_TOLERANCE_SECS);

    // Expired entries first, then the size cap.
    while let Some(front) = inner.seen_nonces.front() {
        if front.seen_at < horizon || inner.seen_nonces.len() >= MAX_SEEN_NONCES {
            inner.seen_nonces.pop_front();
        } else {
            break;
        }
    }

    let replayed = inner
        .seen_nonces
        .iter()
        .any(|seen| seen.client_id == client_id && seen.nonce == nonce);
    if replayed {
        return Err(AuthError::ReplayedNonce);
    }

    inner.seen_nonces.push_back(SeenNonce {
        client_id: client_id.to_string(),
        nonce: nonce.to_string(),
        seen_at: now,
    });
    Ok(())
}

/// Compute the hex-encoded challenge signature.
///
/// Shared between the server-side verifier, the companion client, and
/// tests.
#[must_use]
pub fn sign_challenge(secret: &[u8], client_id: &str, nonce: &str, timestamp: i64) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(format!("{client_id}:{nonce}:{timestamp}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time string equality; unequal lengths compare unequal.
fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}
