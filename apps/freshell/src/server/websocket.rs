//! Session protocol handler: terminates one persistent client connection,
//! walks it through `Connecting → Authenticating → Ready → Closed`, and
//! routes domain verbs into the registry. A connection failing auth is
//! closed with a reserved code; a malformed message in Ready is answered
//! with `error` and the connection stays open.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{token_fingerprint, Config};
use crate::protocol::{
    ClientMessage, ErrorCode, ServerMessage, CLOSE_HELLO_TIMEOUT, CLOSE_INVALID_AUTH,
};
use crate::server::registry::{ClientTx, ConnId, CreateOptions, Outbound};
use crate::server::AppState;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    // All writes to this connection flow through one task; registry
    // broadcasts and handshake replies share the same ordered queue.
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Message(msg) => {
                    let Ok(json) = serde_json::to_string(&msg) else {
                        continue;
                    };
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    debug!(conn_id, "connection opened");

    if authenticate(&mut receiver, &tx, &state.config, conn_id).await {
        ready_loop(&mut receiver, &tx, &state, conn_id).await;
    }

    state.registry.unregister_watcher(conn_id);
    drop(tx);
    let _ = writer.await;
    debug!(conn_id, "connection closed");
}

fn send(tx: &ClientTx, msg: ServerMessage) {
    let _ = tx.send(Outbound::Message(msg));
}

fn close(tx: &ClientTx, code: u16, reason: &str) {
    let _ = tx.send(Outbound::Close {
        code,
        reason: reason.to_string(),
    });
}

/// Waits for a valid `hello{token}`. Only `ping` is serviced beforehand;
/// anything else is rejected and the connection is closed with a reserved
/// code, as is running out the hello timer.
async fn authenticate(
    receiver: &mut SplitStream<WebSocket>,
    tx: &ClientTx,
    config: &Config,
    conn_id: ConnId,
) -> bool {
    let deadline = tokio::time::Instant::now() + config.hello_timeout;
    loop {
        let frame = match tokio::time::timeout_at(deadline, receiver.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                debug!(conn_id, "no hello before timeout");
                close(tx, CLOSE_HELLO_TIMEOUT, "hello timeout");
                return false;
            }
        };
        let Some(Ok(frame)) = frame else {
            return false;
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    reject_unauthenticated(tx, conn_id);
                    return false;
                }
            },
            Message::Close(_) => return false,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Hello { token }) => {
                if token_matches(&config.auth_token, &token) {
                    info!(conn_id, token = %token_fingerprint(&token), "client authenticated");
                    send(tx, ServerMessage::Ready);
                    return true;
                }
                warn!(conn_id, "hello with invalid token");
                send(
                    tx,
                    ServerMessage::error(ErrorCode::NotAuthenticated, "invalid token"),
                );
                close(tx, CLOSE_INVALID_AUTH, "invalid token");
                return false;
            }
            Ok(ClientMessage::Ping { timestamp }) => {
                send(tx, ServerMessage::Pong { timestamp });
            }
            Ok(_) | Err(_) => {
                reject_unauthenticated(tx, conn_id);
                return false;
            }
        }
    }
}

fn reject_unauthenticated(tx: &ClientTx, conn_id: ConnId) {
    debug!(conn_id, "message before hello");
    send(
        tx,
        ServerMessage::error(ErrorCode::NotAuthenticated, "hello required"),
    );
    close(tx, CLOSE_INVALID_AUTH, "not authenticated");
}

async fn ready_loop(
    receiver: &mut SplitStream<WebSocket>,
    tx: &ClientTx,
    state: &AppState,
    conn_id: ConnId,
) {
    let registry = &state.registry;
    registry.register_watcher(conn_id, tx.clone());
    let mut attached: HashSet<String> = HashSet::new();

    while let Some(frame) = receiver.next().await {
        let Ok(frame) = frame else { break };
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    send(
                        tx,
                        ServerMessage::error(ErrorCode::InvalidMessage, "frame is not utf-8"),
                    );
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(msg) => handle_message(state, conn_id, tx, &mut attached, msg),
            Err(err) => {
                debug!(conn_id, error = %err, "unparseable message");
                send(
                    tx,
                    ServerMessage::error(
                        ErrorCode::InvalidMessage,
                        format!("invalid message: {err}"),
                    ),
                );
            }
        }
    }

    for terminal_id in attached {
        registry.detach(&terminal_id, conn_id);
    }
}

fn handle_message(
    state: &AppState,
    conn_id: ConnId,
    tx: &ClientTx,
    attached: &mut HashSet<String>,
    msg: ClientMessage,
) {
    let registry = &state.registry;
    match msg {
        ClientMessage::Hello { .. } => {
            send(
                tx,
                ServerMessage::error(ErrorCode::InvalidMessage, "already authenticated"),
            );
        }
        ClientMessage::TerminalCreate {
            request_id,
            mode,
            shell,
            command,
            cwd,
            cols,
            rows,
        } => {
            let record = registry.create(CreateOptions {
                mode,
                shell,
                command,
                cwd: cwd.map(Into::into),
                cols: cols.unwrap_or(80),
                rows: rows.unwrap_or(24),
            });
            send(
                tx,
                ServerMessage::TerminalCreated {
                    request_id,
                    terminal_id: record.terminal_id().to_string(),
                },
            );
        }
        ClientMessage::TerminalAttach {
            terminal_id,
            last_seq,
        } => {
            if registry.attach(&terminal_id, conn_id, tx, last_seq) {
                attached.insert(terminal_id);
            } else {
                send_unknown_terminal(tx, terminal_id);
            }
        }
        ClientMessage::TerminalDetach { terminal_id } => {
            if registry.detach(&terminal_id, conn_id) {
                attached.remove(&terminal_id);
                send(tx, ServerMessage::TerminalDetached { terminal_id });
            } else {
                send_unknown_terminal(tx, terminal_id);
            }
        }
        ClientMessage::TerminalInput { terminal_id, data } => {
            if !registry.input(&terminal_id, data.as_bytes()) {
                send_unknown_terminal(tx, terminal_id);
            }
        }
        ClientMessage::TerminalResize {
            terminal_id,
            cols,
            rows,
        } => {
            if !registry.resize(&terminal_id, cols, rows) {
                send_unknown_terminal(tx, terminal_id);
            }
        }
        ClientMessage::TerminalKill { terminal_id } => {
            if !registry.kill(&terminal_id) {
                send_unknown_terminal(tx, terminal_id);
            } else {
                attached.remove(&terminal_id);
            }
        }
        ClientMessage::TerminalList => {
            send(
                tx,
                ServerMessage::TerminalList {
                    terminals: registry.list(),
                },
            );
        }
        ClientMessage::Ping { timestamp } => {
            send(tx, ServerMessage::Pong { timestamp });
        }
    }
}

fn send_unknown_terminal(tx: &ClientTx, terminal_id: String) {
    send(
        tx,
        ServerMessage::terminal_error(
            ErrorCode::InvalidTerminalId,
            "unknown terminal",
            terminal_id,
        ),
    );
}

/// Constant-time token comparison; an empty configured token never matches.
fn token_matches(expected: &str, provided: &str) -> bool {
    let expected = expected.as_bytes();
    let provided = provided.as_bytes();
    let mut diff = expected.len() ^ provided.len();
    for i in 0..expected.len().max(provided.len()) {
        let a = expected.get(i).copied().unwrap_or(0);
        let b = provided.get(i).copied().unwrap_or(0);
        diff |= (a ^ b) as usize;
    }
    diff == 0 && !expected.is_empty()
}
