//! Protocol client: connect, authenticate, run commands.
//!
//! Speaks the same framed protocol as the daemon. After authentication
//! every request body is encrypted with the client cipher; the session id
//! returned by the handshake is kept for display, the connection itself
//! is the authorisation context.

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use spindle_core::auth::sign_challenge;
use spindle_core::crypto::{CipherMode, XxteaCipher};
use spindle_daemon::protocol::{
    AuthRequestBody, AuthResponseBody, CommandRequestBody, CommandResponseBody, ErrorResponseBody,
    HeartbeatResponseBody, Message, MessageCodec, MessageType, parse_body,
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Client configuration file (`client.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Server address, `host:port`.
    pub server_addr: String,
    /// Client identity.
    pub client_id: String,
    /// Shared secret.
    pub secret: String,
    /// Body cipher mode; must match the server.
    #[serde(default)]
    pub cipher_mode: CipherMode,
}

impl ClientConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read client config {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse client config {}", path.display()))
    }
}

/// Outcome of one command invocation.
#[derive(Debug)]
pub struct CommandOutcome {
    /// Whether the plugin reported success.
    pub success: bool,
    /// Server-side message, usually the error text on failure.
    pub message: Option<String>,
}

/// A connected, optionally authenticated protocol client.
pub struct Client {
    config: ClientConfig,
    framed: Framed<TcpStream, MessageCodec>,
    cipher: XxteaCipher,
    session_id: Option<String>,
    request_seq: u64,
}

impl Client {
    /// Connect to the configured server.
    ///
    /// # Errors
    ///
    /// Fails on connection errors or an empty secret.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let cipher = XxteaCipher::with_mode(config.secret.as_bytes(), config.cipher_mode)
            .context("invalid client secret")?;
        let stream = TcpStream::connect(&config.server_addr)
            .await
            .with_context(|| format!("failed to connect to {}", config.server_addr))?;

        Ok(Self {
            config,
            framed: Framed::new(stream, MessageCodec::new()),
            cipher,
            session_id: None,
            request_seq: 0,
        })
    }

    /// The session id minted at authentication.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn next_request_id(&mut self) -> String {
        self.request_seq += 1;
        format!("req-{}", self.request_seq)
    }

    /// Authenticate with the HMAC challenge. Must be the first exchange.
    ///
    /// # Errors
    ///
    /// Fails when the server rejects the credentials or the connection
    /// drops.
    pub async fn authenticate(&mut self) -> Result<String> {
        let request_id = self.next_request_id();
        let nonce = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp();
        let body = AuthRequestBody {
            client_id: self.config.client_id.clone(),
            nonce: nonce.clone(),
            timestamp,
            signature: sign_challenge(
                self.config.secret.as_bytes(),
                &self.config.client_id,
                &nonce,
                timestamp,
            ),
        };

        self.framed
            .send(Message::auth_request(request_id.as_str(), &body)?)
            .await?;

        let response = self
            .next_message()
            .await?
            .ok_or_else(|| anyhow!("server closed connection during authentication"))?;
        if response.header.msg_type != MessageType::AuthResponse {
            bail!("unexpected reply to auth request: {:?}", response.header.msg_type);
        }

        let body: AuthResponseBody = parse_body(&response.body)?;
        if !body.success {
            bail!(
                "authentication failed: {}",
                body.message.unwrap_or_else(|| "unknown reason".to_string())
            );
        }
        let session_id = body
            .session_id
            .ok_or_else(|| anyhow!("server accepted auth without a session id"))?;
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// Run a one-shot command, copying streamed output into `sink`.
    ///
    /// Returns once the terminal frame arrives; `DATA_STREAM` frames for
    /// other request ids are not expected on this client (one request at
    /// a time) and are skipped.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or a server-side `ERROR_RESPONSE`.
    pub async fn execute<W>(
        &mut self,
        plugin: &str,
        command: &str,
        args: &[String],
        sink: &mut W,
    ) -> Result<CommandOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        let request_id = self.next_request_id();
        let body = CommandRequestBody {
            plugin: plugin.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            interactive: false,
        };
        let request = Message::command_request(request_id.as_str(), &body, false)?;
        self.send_sealed(request).await?;

        loop {
            let msg = self
                .next_message()
                .await?
                .ok_or_else(|| anyhow!("server closed connection mid-command"))?;
            if msg.header.request_id != request_id {
                continue;
            }
            match msg.header.msg_type {
                MessageType::DataStream => {
                    // Legacy cipher padding would corrupt raw output;
                    // strip the trailing zeros it appends.
                    let payload = trim_padding(&msg.body);
                    sink.write_all(payload).await?;
                    sink.flush().await?;
                },
                MessageType::CommandResponse => {
                    let body: CommandResponseBody = parse_body(&msg.body)?;
                    return Ok(CommandOutcome {
                        success: body.success,
                        message: body.message,
                    });
                },
                MessageType::ErrorResponse => {
                    let body: ErrorResponseBody = parse_body(&msg.body)?;
                    bail!("server error {}: {}", body.code, body.message);
                },
                other => bail!("unexpected frame type during command: {other:?}"),
            }
        }
    }

    /// Probe server liveness; returns the server's timestamp.
    ///
    /// # Errors
    ///
    /// Fails on transport errors or an unexpected reply.
    pub async fn heartbeat(&mut self) -> Result<i64> {
        let request_id = self.next_request_id();
        let request = Message::heartbeat_request(request_id.as_str(), Utc::now().timestamp(), false)?;
        self.send_sealed(request).await?;

        let response = self
            .next_message()
            .await?
            .ok_or_else(|| anyhow!("server closed connection during heartbeat"))?;
        if response.header.msg_type != MessageType::HeartbeatResponse {
            bail!("unexpected reply to heartbeat: {:?}", response.header.msg_type);
        }
        let body: HeartbeatResponseBody = parse_body(&response.body)?;
        Ok(body.timestamp)
    }

    /// Close the connection.
    pub async fn close(mut self) {
        let _ = self.framed.close().await;
    }

    /// Encrypt a message body and send the frame.
    async fn send_sealed(&mut self, mut msg: Message) -> Result<()> {
        let sealed = self.cipher.encrypt(&msg.body);
        msg.header.encrypted = true;
        msg.header.length = sealed.len() as u32;
        msg.body = Bytes::from(sealed);
        self.framed.send(msg).await?;
        Ok(())
    }

    /// Receive a frame, decrypting its body when flagged.
    async fn next_message(&mut self) -> Result<Option<Message>> {
        match self.framed.next().await {
            Some(Ok(mut msg)) => {
                if msg.header.encrypted {
                    msg.body = Bytes::from(
                        self.cipher
                            .decrypt(&msg.body)
                            .context("failed to decrypt server frame")?,
                    );
                }
                Ok(Some(msg))
            },
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Strip trailing zero bytes left by legacy cipher block padding.
fn trim_padding(body: &[u8]) -> &[u8] {
    let end = body.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &body[..end]
}
