//! Command dispatcher: bridges one `COMMAND_REQUEST` to a plugin
//! execution and streams its output back as frames.
//!
//! Each in-flight request runs in its own task. The dispatcher
//!
//! 1. gates on the client's plugin permission,
//! 2. resolves the plugin (kind and lifecycle state checked),
//! 3. wires stdin (a channel-fed reader, interactive requests only) and
//!    stdout (an in-process pipe),
//! 4. invokes `execute` bounded by the connection lifetime,
//! 5. forwards pipe bytes as `DATA_STREAM` frames in order, then sends
//!    the terminal `COMMAND_RESPONSE` after all of them.
//!
//! Backpressure is the outbound channel plus TCP flow control: if the
//! socket cannot drain, the forwarder blocks and the plugin blocks on the
//! pipe. Output never spills to disk.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use spindle_core::auth::AuthError;
use spindle_core::plugin::{PluginContext, PluginError};
use spindle_core::signal::ShutdownSignal;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{CommandRequestBody, CommandResponseBody, Message};
use crate::server::ServerShared;

/// Output chunk bound for `DATA_STREAM` frames.
const STREAM_CHUNK_LEN: usize = 4096;

/// In-process pipe capacity between a plugin and its forwarder.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Book-keeping for one in-flight request on a connection.
pub(crate) struct Inflight {
    /// Write end of the request's stdin; present for interactive
    /// requests until the client closes it.
    pub stdin: Option<mpsc::Sender<Bytes>>,
}

/// `request_id → in-flight request` map, owned by the connection.
pub(crate) type InflightMap = Arc<Mutex<HashMap<String, Inflight>>>;

/// Removes the request from the in-flight map when the worker ends,
/// whichever path it takes out.
struct InflightGuard {
    map: InflightMap,
    request_id: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .expect("in-flight map lock poisoned")
            .remove(&self.request_id);
    }
}

/// An `AsyncRead` fed by `DATA_STREAM` frames routed from the connection.
///
/// EOF is the sender side dropping: either the client sent a zero-length
/// `DATA_STREAM` or the connection is tearing down.
struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    self.pending = chunk;
                },
                // Channel closed: clean EOF.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Run one command request to its terminal frame.
///
/// The caller has already registered the request in `inflight`; this
/// worker deregisters it on every exit path. Exactly one terminal frame
/// (`ERROR_RESPONSE` or `COMMAND_RESPONSE`) is sent unless the outbound
/// channel is already gone.
pub(crate) async fn run_command(
    shared: Arc<ServerShared>,
    client_id: String,
    request_id: String,
    request: CommandRequestBody,
    encrypted: bool,
    stdin: Option<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Message>,
    cancel: ShutdownSignal,
    inflight: InflightMap,
) {
    let _guard = InflightGuard {
        map: inflight,
        request_id: request_id.clone(),
    };

    // Permission gate.
    match shared.auth.has_plugin_permission(&client_id, &request.plugin) {
        Ok(true) => {},
        Ok(false) => {
            debug!(
                client = %client_id,
                plugin = %request.plugin,
                "command rejected: permission denied"
            );
            send_error(
                &outbound,
                &request_id,
                403,
                format!("no permission to use plugin: {}", request.plugin),
                encrypted,
            )
            .await;
            return;
        },
        // The client record can disappear mid-session on revocation.
        Err(AuthError::UnknownClient) => {
            send_error(&outbound, &request_id, 401, "client revoked", encrypted).await;
            return;
        },
        Err(e) => {
            send_error(&outbound, &request_id, 500, e.to_string(), encrypted).await;
            return;
        },
    }

    // Resolve: kind and lifecycle state both checked by the registry.
    let plugin = match shared.plugins.resolve_command(&request.plugin).await {
        Ok(plugin) => plugin,
        Err(e) => {
            let code = plugin_error_code(&e);
            send_error(&outbound, &request_id, code, e.to_string(), encrypted).await;
            return;
        },
    };

    // Wire stdin and stdout.
    let input: spindle_core::plugin::CommandInput = match stdin {
        Some(rx) => Box::new(ChannelReader::new(rx)),
        None => Box::new(tokio::io::empty()),
    };
    let (mut stdout_rd, stdout_wr) = tokio::io::duplex(PIPE_CAPACITY);

    // Invoke. The plugin observes `cancel` through its context, so
    // connection close and server shutdown end the call.
    let mut argv = Vec::with_capacity(1 + request.args.len());
    argv.push(request.command.clone());
    argv.extend(request.args.iter().cloned());

    let exec = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let ctx = PluginContext::new(cancel);
            plugin.execute(&ctx, &argv, input, Box::new(stdout_wr)).await
        }
    });

    // Forward pipe bytes as DATA_STREAM frames until the plugin drops its
    // write end. Order is preserved; chunks are bounded but may be smaller.
    let mut buf = vec![0u8; STREAM_CHUNK_LEN];
    loop {
        match stdout_rd.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Message::data_stream(
                    request_id.clone(),
                    Bytes::copy_from_slice(&buf[..n]),
                    encrypted,
                );
                if outbound.send(frame).await.is_err() {
                    // Connection writer is gone; keep draining so the
                    // plugin can finish and report.
                    break;
                }
            },
        }
    }

    // Dropping the read end fails any further plugin writes, so a plugin
    // mid-write cannot wedge the worker once the forwarder has stopped.
    drop(stdout_rd);

    // Terminal frame, strictly after every DATA_STREAM for this request.
    let result = match exec.await {
        Ok(result) => result,
        Err(join_error) => {
            warn!(
                plugin = %request.plugin,
                request_id = %request_id,
                error = %join_error,
                "plugin execution task failed"
            );
            Err(PluginError::Failed("plugin execution panicked".to_string()))
        },
    };

    let body = CommandResponseBody {
        success: result.is_ok(),
        message: result.as_ref().err().map(ToString::to_string),
        data: None,
    };
    match Message::command_response(request_id.as_str(), &body, encrypted) {
        Ok(frame) => {
            let _ = outbound.send(frame).await;
        },
        Err(e) => warn!(request_id = %request_id, error = %e, "failed to build command response"),
    }
}

/// Map a registry error onto the wire error taxonomy.
fn plugin_error_code(error: &PluginError) -> u16 {
    match error {
        PluginError::NotFound { .. } => 404,
        PluginError::TypeMismatch { .. }
        | PluginError::InvalidState { .. }
        | PluginError::AlreadyExists { .. }
        | PluginError::AlreadyEnabled { .. }
        | PluginError::AlreadyDisabled { .. } => 409,
        _ => 500,
    }
}

/// Send an `ERROR_RESPONSE`, logging instead of failing when the
/// connection is already gone.
async fn send_error(
    outbound: &mpsc::Sender<Message>,
    request_id: &str,
    code: u16,
    message: impl Into<String>,
    encrypted: bool,
) {
    match Message::error_response(request_id, code, message, encrypted) {
        Ok(frame) => {
            let _ = outbound.send(frame).await;
        },
        Err(e) => warn!(request_id, error = %e, "failed to build error response"),
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn channel_reader_yields_chunks_then_eof() {
        let (tx, rx) = mpsc::channel(4);
        let mut reader = ChannelReader::new(rx);

        tx.send(Bytes::from_static(b"hello ")).await.unwrap();
        tx.send(Bytes::from_static(b"world")).await.unwrap();
        drop(tx);

        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn channel_reader_splits_large_chunks() {
        let (tx, rx) = mpsc::channel(1);
        let mut reader = ChannelReader::new(rx);

        tx.send(Bytes::from(vec![7u8; 100])).await.unwrap();
        drop(tx);

        let mut small = [0u8; 32];
        let n = reader.read(&mut small).await.unwrap();
        assert_eq!(n, 32);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest.len(), 68);
    }

    #[test]
    fn error_codes_follow_taxonomy() {
        assert_eq!(
            plugin_error_code(&PluginError::NotFound { id: "x".into() }),
            404
        );
        assert_eq!(
            plugin_error_code(&PluginError::InvalidState {
                id: "x".into(),
                state: spindle_core::plugin::PluginState::Disabled,
                operation: "execute",
            }),
            409
        );
        assert_eq!(plugin_error_code(&PluginError::Failed("boom".into())), 500);
    }
}
