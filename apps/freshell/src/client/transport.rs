//! Client transport adapter: wraps one physical WebSocket connection,
//! performs the hello handshake, applies [`SequenceState`] decisions to
//! inbound output frames, and surfaces accepted data and control events to
//! the embedding UI in order. Rejected frames are logged, never rendered.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::client::sequence::{AttachReady, FrameOutcome, SequenceState};
use crate::error::ClientError;
use crate::protocol::{ClientMessage, ErrorCode, ServerMessage, TerminalMode, TerminalSummary};

/// Events surfaced to the embedding UI. `Output.seq_end` is the client's new
/// high-water mark for that terminal; pass it back via [`ClientTransport::attach_from`]
/// when reattaching after a reconnect.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Ready,
    AttachReady {
        terminal_id: String,
        head_seq: u64,
    },
    Output {
        terminal_id: String,
        seq_end: u64,
        data: String,
    },
    /// The terminal's sequence counter restarted; reset the renderer before
    /// applying the output frame that follows.
    FreshReset {
        terminal_id: String,
    },
    Gap {
        terminal_id: String,
        from_seq: u64,
        to_seq: u64,
        reason: String,
    },
    Snapshot {
        terminal_id: String,
        snapshot: String,
    },
    Created {
        request_id: String,
        terminal_id: String,
    },
    Detached {
        terminal_id: String,
    },
    Exit {
        terminal_id: String,
        exit_code: Option<i32>,
    },
    ListUpdated {
        terminals: Vec<TerminalSummary>,
    },
    Error {
        code: ErrorCode,
        message: String,
        terminal_id: Option<String>,
    },
    Pong {
        timestamp: Option<i64>,
    },
    Closed,
}

pub struct ClientTransport {
    commands: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl ClientTransport {
    /// Connects and sends `hello`; await [`ClientTransport::wait_ready`] (or
    /// the `Ready` event) before issuing domain verbs.
    pub async fn connect(url: &str, token: &str) -> Result<Self, ClientError> {
        let (ws, _) = connect_async(url).await?;
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(ws, command_rx, event_tx));
        let transport = Self {
            commands,
            events,
            task,
        };
        transport.send(ClientMessage::Hello {
            token: token.to_string(),
        })?;
        Ok(transport)
    }

    pub async fn wait_ready(&mut self) -> Result<(), ClientError> {
        while let Some(event) = self.events.recv().await {
            match event {
                ClientEvent::Ready => return Ok(()),
                ClientEvent::Error { message, .. } => {
                    return Err(ClientError::HelloRejected(message));
                }
                ClientEvent::Closed => break,
                _ => {}
            }
        }
        Err(ClientError::ClosedBeforeReady)
    }

    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    pub fn create(
        &self,
        request_id: &str,
        mode: TerminalMode,
        shell: Option<String>,
        command: Vec<String>,
    ) -> Result<(), ClientError> {
        self.send(ClientMessage::TerminalCreate {
            request_id: request_id.to_string(),
            mode,
            shell,
            command,
            cwd: None,
            cols: None,
            rows: None,
        })
    }

    /// Attach with no prior knowledge; the server replays the retained
    /// backlog.
    pub fn attach(&self, terminal_id: &str) -> Result<(), ClientError> {
        self.attach_from(terminal_id, 0)
    }

    /// Attach declaring the highest sequence number already applied, so the
    /// server replays only the missing suffix.
    pub fn attach_from(&self, terminal_id: &str, last_seq: u64) -> Result<(), ClientError> {
        self.send(ClientMessage::TerminalAttach {
            terminal_id: terminal_id.to_string(),
            last_seq,
        })
    }

    pub fn detach(&self, terminal_id: &str) -> Result<(), ClientError> {
        self.send(ClientMessage::TerminalDetach {
            terminal_id: terminal_id.to_string(),
        })
    }

    pub fn input(&self, terminal_id: &str, data: &str) -> Result<(), ClientError> {
        self.send(ClientMessage::TerminalInput {
            terminal_id: terminal_id.to_string(),
            data: data.to_string(),
        })
    }

    pub fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.send(ClientMessage::TerminalResize {
            terminal_id: terminal_id.to_string(),
            cols,
            rows,
        })
    }

    pub fn kill(&self, terminal_id: &str) -> Result<(), ClientError> {
        self.send(ClientMessage::TerminalKill {
            terminal_id: terminal_id.to_string(),
        })
    }

    pub fn list(&self) -> Result<(), ClientError> {
        self.send(ClientMessage::TerminalList)
    }

    pub fn ping(&self, timestamp: Option<i64>) -> Result<(), ClientError> {
        self.send(ClientMessage::Ping { timestamp })
    }

    fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        self.commands
            .send(msg)
            .map_err(|_| ClientError::Disconnected)
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reassembly buffer for a chunked replay unit.
struct ChunkAssembly {
    total_chunks: usize,
    next_index: usize,
    seq_start: u64,
    seq_end: u64,
    data: String,
}

struct ConnectionState {
    sessions: HashMap<String, SequenceState>,
    assemblies: HashMap<String, ChunkAssembly>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            sessions: HashMap::new(),
            assemblies: HashMap::new(),
        }
    }
}

async fn run_connection(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut commands: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let (mut sink, mut stream) = ws.split();
    let mut state = ConnectionState::new();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match &cmd {
                    ClientMessage::TerminalAttach { terminal_id, .. } => {
                        let seq = state.sessions.remove(terminal_id).unwrap_or_default();
                        state.sessions.insert(terminal_id.clone(), seq.begin_attach());
                    }
                    ClientMessage::TerminalDetach { terminal_id } => {
                        // SequenceState lives for the attachment only; the
                        // next attach starts from the server handshake.
                        state.sessions.remove(terminal_id);
                        state.assemblies.remove(terminal_id);
                    }
                    _ => {}
                }
                let Ok(json) = serde_json::to_string(&cmd) else { continue };
                if sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        handle_server_text(&text, &mut state, &events);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Ok(text) = String::from_utf8(data) {
                            handle_server_text(&text, &mut state, &events);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(ClientEvent::Closed);
}

fn handle_server_text(
    text: &str,
    state: &mut ConnectionState,
    events: &mpsc::UnboundedSender<ClientEvent>,
) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => handle_server_message(msg, state, events),
        Err(err) => debug!(error = %err, "unparseable server message"),
    }
}

fn handle_server_message(
    msg: ServerMessage,
    state: &mut ConnectionState,
    events: &mpsc::UnboundedSender<ClientEvent>,
) {
    match msg {
        ServerMessage::Ready => emit(events, ClientEvent::Ready),
        ServerMessage::TerminalAttachReady {
            terminal_id,
            head_seq,
            replay_from_seq,
            replay_to_seq,
            fresh_sequence,
        } => {
            let seq = state
                .sessions
                .remove(&terminal_id)
                .unwrap_or_default()
                .on_attach_ready(AttachReady {
                    head_seq,
                    replay_from_seq,
                    replay_to_seq,
                    fresh_sequence,
                });
            state.sessions.insert(terminal_id.clone(), seq);
            emit(
                events,
                ClientEvent::AttachReady {
                    terminal_id,
                    head_seq,
                },
            );
        }
        ServerMessage::TerminalOutput {
            terminal_id,
            seq_start,
            seq_end,
            data,
        } => apply_frame(terminal_id, seq_start, seq_end, data, state, events),
        ServerMessage::TerminalOutputGap {
            terminal_id,
            from_seq,
            to_seq,
            reason,
        } => {
            let seq = state.sessions.entry(terminal_id.clone()).or_default();
            *seq = seq.on_output_gap(from_seq, to_seq);
            emit(
                events,
                ClientEvent::Gap {
                    terminal_id,
                    from_seq,
                    to_seq,
                    reason,
                },
            );
        }
        ServerMessage::TerminalAttachedStart {
            terminal_id,
            total_chunks,
            seq_start,
            seq_end,
        } => {
            state.assemblies.insert(
                terminal_id,
                ChunkAssembly {
                    total_chunks,
                    next_index: 0,
                    seq_start,
                    seq_end,
                    data: String::new(),
                },
            );
        }
        ServerMessage::TerminalAttachedChunk {
            terminal_id,
            index,
            data,
        } => {
            let Some(assembly) = state.assemblies.get_mut(&terminal_id) else {
                warn!(terminal_id = %terminal_id, "chunk without start");
                return;
            };
            if index != assembly.next_index {
                warn!(
                    terminal_id = %terminal_id,
                    index,
                    expected = assembly.next_index,
                    "chunk out of order; abandoning assembly"
                );
                state.assemblies.remove(&terminal_id);
                return;
            }
            assembly.data.push_str(&data);
            assembly.next_index += 1;
        }
        ServerMessage::TerminalAttachedEnd { terminal_id } => {
            let Some(assembly) = state.assemblies.remove(&terminal_id) else {
                return;
            };
            if assembly.next_index != assembly.total_chunks {
                warn!(
                    terminal_id = %terminal_id,
                    received = assembly.next_index,
                    expected = assembly.total_chunks,
                    "incomplete chunked unit dropped"
                );
                return;
            }
            // The reassembled unit is one sequence-tagged frame.
            apply_frame(
                terminal_id,
                assembly.seq_start,
                assembly.seq_end,
                assembly.data,
                state,
                events,
            );
        }
        ServerMessage::TerminalAttached {
            terminal_id,
            snapshot,
        } => emit(
            events,
            ClientEvent::Snapshot {
                terminal_id,
                snapshot,
            },
        ),
        ServerMessage::TerminalCreated {
            request_id,
            terminal_id,
        } => emit(
            events,
            ClientEvent::Created {
                request_id,
                terminal_id,
            },
        ),
        ServerMessage::TerminalDetached { terminal_id } => {
            emit(events, ClientEvent::Detached { terminal_id })
        }
        ServerMessage::TerminalExit {
            terminal_id,
            exit_code,
        } => emit(
            events,
            ClientEvent::Exit {
                terminal_id,
                exit_code,
            },
        ),
        ServerMessage::TerminalList { terminals }
        | ServerMessage::TerminalListUpdated { terminals } => {
            emit(events, ClientEvent::ListUpdated { terminals })
        }
        ServerMessage::Error {
            code,
            message,
            terminal_id,
        } => emit(
            events,
            ClientEvent::Error {
                code,
                message,
                terminal_id,
            },
        ),
        ServerMessage::Pong { timestamp } => emit(events, ClientEvent::Pong { timestamp }),
    }
}

fn apply_frame(
    terminal_id: String,
    seq_start: u64,
    seq_end: u64,
    data: String,
    state: &mut ConnectionState,
    events: &mpsc::UnboundedSender<ClientEvent>,
) {
    let seq = state.sessions.entry(terminal_id.clone()).or_default();
    match seq.on_output_frame(seq_start, seq_end) {
        FrameOutcome::Accepted {
            state: next,
            fresh_reset,
        } => {
            *seq = next;
            if fresh_reset {
                emit(
                    events,
                    ClientEvent::FreshReset {
                        terminal_id: terminal_id.clone(),
                    },
                );
            }
            emit(
                events,
                ClientEvent::Output {
                    terminal_id,
                    seq_end,
                    data,
                },
            );
        }
        FrameOutcome::Rejected { reason } => {
            debug!(
                terminal_id = %terminal_id,
                seq_start,
                seq_end,
                reason = ?reason,
                "dropped output frame"
            );
        }
    }
}

fn emit(events: &mpsc::UnboundedSender<ClientEvent>, event: ClientEvent) {
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (
        ConnectionState,
        mpsc::UnboundedSender<ClientEvent>,
        mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionState::new(), tx, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn output(terminal_id: &str, seq_start: u64, seq_end: u64, data: &str) -> ServerMessage {
        ServerMessage::TerminalOutput {
            terminal_id: terminal_id.to_string(),
            seq_start,
            seq_end,
            data: data.to_string(),
        }
    }

    #[test]
    fn duplicate_frames_after_reconnect_are_not_rendered_twice() {
        let (mut state, tx, mut rx) = setup();
        handle_server_message(output("t-1", 1, 5, "hello"), &mut state, &tx);
        handle_server_message(output("t-1", 1, 5, "hello"), &mut state, &tx);
        handle_server_message(output("t-1", 6, 7, "!\n"), &mut state, &tx);

        let rendered: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Output { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(rendered, vec!["hello".to_string(), "!\n".to_string()]);
    }

    #[test]
    fn replay_window_frames_pass_through_in_order() {
        let (mut state, tx, mut rx) = setup();
        handle_server_message(
            ServerMessage::TerminalAttachReady {
                terminal_id: "t-1".to_string(),
                head_seq: 8,
                replay_from_seq: 6,
                replay_to_seq: 8,
                fresh_sequence: false,
            },
            &mut state,
            &tx,
        );
        handle_server_message(output("t-1", 6, 8, "tail"), &mut state, &tx);
        handle_server_message(output("t-1", 9, 9, "x"), &mut state, &tx);

        let rendered: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Output { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(rendered, vec!["tail".to_string(), "x".to_string()]);
    }

    #[test]
    fn chunked_unit_is_reassembled_then_sequence_checked() {
        let (mut state, tx, mut rx) = setup();
        handle_server_message(
            ServerMessage::TerminalAttachedStart {
                terminal_id: "t-1".to_string(),
                total_chunks: 2,
                seq_start: 1,
                seq_end: 8,
            },
            &mut state,
            &tx,
        );
        handle_server_message(
            ServerMessage::TerminalAttachedChunk {
                terminal_id: "t-1".to_string(),
                index: 0,
                data: "abcd".to_string(),
            },
            &mut state,
            &tx,
        );
        handle_server_message(
            ServerMessage::TerminalAttachedChunk {
                terminal_id: "t-1".to_string(),
                index: 1,
                data: "efgh".to_string(),
            },
            &mut state,
            &tx,
        );
        handle_server_message(
            ServerMessage::TerminalAttachedEnd {
                terminal_id: "t-1".to_string(),
            },
            &mut state,
            &tx,
        );

        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            ClientEvent::Output { seq_end: 8, data, .. } if data == "abcdefgh"
        )));

        // The unit advanced last_seq; re-delivery of its range is dropped.
        handle_server_message(output("t-1", 1, 8, "abcdefgh"), &mut state, &tx);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn out_of_order_chunk_abandons_the_assembly() {
        let (mut state, tx, mut rx) = setup();
        handle_server_message(
            ServerMessage::TerminalAttachedStart {
                terminal_id: "t-1".to_string(),
                total_chunks: 2,
                seq_start: 1,
                seq_end: 8,
            },
            &mut state,
            &tx,
        );
        handle_server_message(
            ServerMessage::TerminalAttachedChunk {
                terminal_id: "t-1".to_string(),
                index: 1,
                data: "efgh".to_string(),
            },
            &mut state,
            &tx,
        );
        handle_server_message(
            ServerMessage::TerminalAttachedEnd {
                terminal_id: "t-1".to_string(),
            },
            &mut state,
            &tx,
        );
        assert!(!drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ClientEvent::Output { .. })));
    }

    #[test]
    fn fresh_reset_precedes_the_restarted_output() {
        let (mut state, tx, mut rx) = setup();
        handle_server_message(output("t-1", 1, 22, "old life"), &mut state, &tx);
        handle_server_message(
            ServerMessage::TerminalAttachReady {
                terminal_id: "t-1".to_string(),
                head_seq: 3,
                replay_from_seq: 0,
                replay_to_seq: 0,
                fresh_sequence: true,
            },
            &mut state,
            &tx,
        );
        handle_server_message(output("t-1", 1, 3, "new"), &mut state, &tx);

        let events = drain(&mut rx);
        let reset_pos = events
            .iter()
            .position(|event| matches!(event, ClientEvent::FreshReset { .. }))
            .expect("fresh reset event");
        let new_pos = events
            .iter()
            .position(
                |event| matches!(event, ClientEvent::Output { data, .. } if data == "new"),
            )
            .expect("restarted output");
        assert!(reset_pos < new_pos);
    }

    #[test]
    fn gap_is_surfaced_and_advances_the_session() {
        let (mut state, tx, mut rx) = setup();
        handle_server_message(
            ServerMessage::TerminalOutputGap {
                terminal_id: "t-1".to_string(),
                from_seq: 1,
                to_seq: 5,
                reason: "evicted".to_string(),
            },
            &mut state,
            &tx,
        );
        handle_server_message(output("t-1", 6, 8, "abc"), &mut state, &tx);
        // The replayed prefix that fell out of retention must not re-render.
        handle_server_message(output("t-1", 1, 5, "lost"), &mut state, &tx);

        let rendered: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Output { data, .. } => Some(data),
                _ => None,
            })
            .collect();
        assert_eq!(rendered, vec!["abc".to_string()]);
    }
}
