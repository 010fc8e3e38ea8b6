//! Per-connection state machine and frame loop.
//!
//! Every accepted socket runs one connection task through the phases
//!
//! ```text
//! INIT ──auth frame──▶ AUTHENTICATING ──ok──▶ OPEN ──close/err──▶ CLOSED
//!                          │                    │
//!                          └──err──▶ CLOSED ◀───┘
//! ```
//!
//! The first frame must be an `AUTH_REQUEST` and must arrive within the
//! configured deadline; anything else aborts the connection. A successful
//! handshake installs the client's body cipher and enters the frame loop.
//!
//! # Writer serialisation
//!
//! Frames are written by a single writer task per connection, fed from an
//! mpsc channel shared by the frame loop and every request worker, so no
//! two frames can interleave their bytes. Body encryption happens in that
//! writer, keyed by the connection cipher.
//!
//! # Teardown
//!
//! Closing (client EOF, frame error, or server shutdown) cancels every
//! in-flight request worker, waits for their terminal frames, drains the
//! writer, and drops the socket. Sessions survive connection close; only
//! revocation or expiry removes them from the store.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use spindle_core::crypto::XxteaCipher;
use spindle_core::signal::{ShutdownController, ShutdownSignal};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::dispatch::{self, Inflight, InflightMap};
use crate::protocol::{
    AuthRequestBody, AuthResponseBody, Message, MessageCodec, MessageType, parse_body,
};
use crate::server::ServerShared;

/// Outbound frame queue depth per connection. Small on purpose: the
/// writer applies TCP backpressure to request workers through it.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Handle one connection from accept to close.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    server_shutdown: ShutdownSignal,
) {
    debug!(%peer, "new connection");

    let codec = MessageCodec::with_limits(
        shared.settings.max_header_len,
        shared.settings.max_body_len,
    );
    let mut framed = Framed::new(stream, codec);

    let Some(authed) = authenticate(&mut framed, &shared, peer).await else {
        return;
    };

    info!(
        %peer,
        client = %authed.client_id,
        session = %authed.session_id,
        "client authenticated"
    );

    run_open_phase(framed, peer, shared, server_shutdown, authed).await;
    debug!(%peer, "connection closed");
}

/// Outcome of the authentication phase.
struct Authenticated {
    client_id: String,
    session_id: String,
    cipher: XxteaCipher,
}

/// INIT → AUTHENTICATING. Returns `None` when the connection must close.
async fn authenticate(
    framed: &mut Framed<TcpStream, MessageCodec>,
    shared: &ServerShared,
    peer: SocketAddr,
) -> Option<Authenticated> {
    let deadline = Duration::from_secs(shared.settings.auth_timeout_secs);
    let first = match timeout(deadline, framed.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => {
            warn!(%peer, error = %e, "failed to read auth frame");
            return None;
        },
        Ok(None) => {
            debug!(%peer, "connection closed before authentication");
            return None;
        },
        Err(_) => {
            warn!(%peer, "authentication deadline expired");
            return None;
        },
    };

    if first.header.msg_type != MessageType::AuthRequest {
        warn!(%peer, msg_type = ?first.header.msg_type, "first frame was not an auth request");
        return None;
    }

    let request_id = first.header.request_id.clone();
    let auth_req: AuthRequestBody = match parse_body(&first.body) {
        Ok(body) => body,
        Err(e) => {
            warn!(%peer, error = %e, "malformed auth request");
            let _ = send_auth_failure(framed, &request_id, "malformed auth request").await;
            return None;
        },
    };

    let session_id = match shared.auth.authenticate(
        &auth_req.client_id,
        &auth_req.nonce,
        auth_req.timestamp,
        &auth_req.signature,
    ) {
        Ok(session_id) => session_id,
        Err(e) => {
            warn!(%peer, client = %auth_req.client_id, error = %e, "authentication failed");
            let _ = send_auth_failure(framed, &request_id, &e.to_string()).await;
            return None;
        },
    };

    // The cipher is keyed by the client secret; a client that just
    // authenticated must still be registered.
    let client = match shared.auth.client(&auth_req.client_id) {
        Ok(client) => client,
        Err(e) => {
            warn!(%peer, client = %auth_req.client_id, error = %e, "client vanished after auth");
            let _ = send_auth_failure(framed, &request_id, &e.to_string()).await;
            return None;
        },
    };
    let cipher = match XxteaCipher::with_mode(client.secret.as_bytes(), shared.settings.cipher_mode)
    {
        Ok(cipher) => cipher,
        Err(e) => {
            warn!(%peer, client = %client.id, error = %e, "cannot build cipher");
            let _ = send_auth_failure(framed, &request_id, "invalid client secret").await;
            return None;
        },
    };

    let response = AuthResponseBody {
        success: true,
        session_id: Some(session_id.clone()),
        message: None,
    };
    let frame = match Message::auth_response(request_id.as_str(), &response) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%peer, error = %e, "failed to build auth response");
            return None;
        },
    };
    if let Err(e) = framed.send(frame).await {
        warn!(%peer, error = %e, "failed to send auth response");
        return None;
    }

    Some(Authenticated {
        client_id: client.id,
        session_id,
        cipher,
    })
}

async fn send_auth_failure(
    framed: &mut Framed<TcpStream, MessageCodec>,
    request_id: &str,
    reason: &str,
) -> Result<(), crate::protocol::ProtocolError> {
    let body = AuthResponseBody {
        success: false,
        session_id: None,
        message: Some(reason.to_string()),
    };
    let frame = Message::auth_response(request_id, &body)?;
    framed.send(frame).await
}

/// OPEN: the frame loop, running until close, error, or shutdown.
async fn run_open_phase(
    framed: Framed<TcpStream, MessageCodec>,
    peer: SocketAddr,
    shared: Arc<ServerShared>,
    server_shutdown: ShutdownSignal,
    authed: Authenticated,
) {
    let (sink, mut stream) = framed.split();

    // Single writer task: the only place frames touch the socket.
    let (outbound, outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);
    let writer = tokio::spawn(write_frames(sink, outbound_rx, authed.cipher.clone(), peer));

    // Connection-scoped cancellation: fires when this loop exits for any
    // reason, including server shutdown, cascading into request workers.
    let conn_ctl = ShutdownController::new();
    let inflight: InflightMap = Arc::new(Mutex::new(HashMap::new()));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let msg = tokio::select! {
            () = server_shutdown.cancelled() => {
                debug!(%peer, "server shutdown reached connection");
                break;
            },
            next = stream.next() => match next {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    // A framing error desynchronizes the stream; report
                    // and close rather than guess at the next boundary.
                    warn!(%peer, error = %e, "frame error, closing connection");
                    if let Ok(frame) = Message::error_response("", 400, e.to_string(), false) {
                        let _ = outbound.send(frame).await;
                    }
                    break;
                },
                None => {
                    debug!(%peer, client = %authed.client_id, "client closed connection");
                    break;
                },
            },
        };

        let encrypted = msg.header.encrypted;
        let request_id = msg.header.request_id.clone();

        // Decrypt before any further parsing; headers are never encrypted.
        let body = if encrypted {
            match authed.cipher.decrypt(&msg.body) {
                Ok(body) => bytes::Bytes::from(body),
                Err(e) => {
                    warn!(%peer, error = %e, "failed to decrypt body");
                    send_error(&outbound, &request_id, 400, "failed to decrypt body", false).await;
                    continue;
                },
            }
        } else {
            msg.body.clone()
        };

        match msg.header.msg_type {
            MessageType::CommandRequest => {
                let request = match parse_body::<crate::protocol::CommandRequestBody>(&body) {
                    Ok(request) => request,
                    Err(e) => {
                        send_error(&outbound, &request_id, 400, e.to_string(), encrypted).await;
                        continue;
                    },
                };

                // One in-flight request per id per connection.
                let duplicate = {
                    let map = inflight.lock().expect("in-flight map lock poisoned");
                    map.contains_key(&request_id)
                };
                if duplicate {
                    send_error(
                        &outbound,
                        &request_id,
                        400,
                        "duplicate request id",
                        encrypted,
                    )
                    .await;
                    continue;
                }
                let stdin_rx = {
                    let mut map = inflight.lock().expect("in-flight map lock poisoned");
                    let (stdin_tx, stdin_rx) = if request.interactive {
                        let (tx, rx) = mpsc::channel::<bytes::Bytes>(OUTBOUND_QUEUE_DEPTH);
                        (Some(tx), Some(rx))
                    } else {
                        (None, None)
                    };
                    map.insert(request_id.clone(), Inflight { stdin: stdin_tx });
                    stdin_rx
                };

                debug!(
                    client = %authed.client_id,
                    plugin = %request.plugin,
                    command = %request.command,
                    request_id = %request_id,
                    interactive = request.interactive,
                    "dispatching command"
                );

                workers.retain(|handle| !handle.is_finished());
                workers.push(tokio::spawn(dispatch::run_command(
                    Arc::clone(&shared),
                    authed.client_id.clone(),
                    request_id,
                    request,
                    encrypted,
                    stdin_rx,
                    outbound.clone(),
                    conn_ctl.signal(),
                    Arc::clone(&inflight),
                )));
            },

            MessageType::DataStream => {
                // Route to the request's stdin. Unknown ids are ignored:
                // the worker may have finished between frames.
                let stdin = {
                    let mut map = inflight.lock().expect("in-flight map lock poisoned");
                    match map.get_mut(&request_id) {
                        Some(entry) if body.is_empty() => {
                            // Zero-length stream closes stdin.
                            entry.stdin.take();
                            None
                        },
                        Some(entry) => entry.stdin.clone(),
                        None => {
                            debug!(request_id = %request_id, "data stream for unknown request");
                            None
                        },
                    }
                };
                if let Some(stdin) = stdin {
                    // A dropped receiver just means the plugin stopped
                    // reading; that is not a connection error.
                    let _ = stdin.send(body).await;
                }
            },

            MessageType::HeartbeatRequest => {
                match Message::heartbeat_response(request_id.as_str(), Utc::now().timestamp(), 0.0, encrypted)
                {
                    Ok(frame) => {
                        if outbound.send(frame).await.is_err() {
                            break;
                        }
                    },
                    Err(e) => warn!(error = %e, "failed to build heartbeat response"),
                }
            },

            other => {
                debug!(%peer, msg_type = ?other, "unsupported message type");
                send_error(&outbound, &request_id, 400, "unsupported message type", encrypted)
                    .await;
            },
        }
    }

    // CLOSED: cancel in-flight workers, let them emit their terminal
    // frames, then drain the writer.
    conn_ctl.trigger();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(%peer, error = %e, "request worker failed");
        }
    }
    drop(outbound);
    if let Err(e) = writer.await {
        warn!(%peer, error = %e, "writer task failed");
    }
}

/// The single socket writer: applies body encryption and preserves frame
/// ordering for the whole connection.
async fn write_frames(
    mut sink: futures::stream::SplitSink<Framed<TcpStream, MessageCodec>, Message>,
    mut rx: mpsc::Receiver<Message>,
    cipher: XxteaCipher,
    peer: SocketAddr,
) {
    while let Some(mut msg) = rx.recv().await {
        if msg.header.encrypted {
            let sealed = cipher.encrypt(&msg.body);
            msg.header.length = sealed.len() as u32;
            msg.body = bytes::Bytes::from(sealed);
        }
        if let Err(e) = sink.send(msg).await {
            warn!(%peer, error = %e, "write failed, dropping connection writer");
            // Drain the channel so senders unblock and observe the close.
            rx.close();
            break;
        }
    }
    let _ = sink.close().await;
}

/// Build and queue an `ERROR_RESPONSE` on the connection.
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
