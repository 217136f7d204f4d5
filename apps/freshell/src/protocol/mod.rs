use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Close code sent when a connection fails authentication (bad or missing token).
pub const CLOSE_INVALID_AUTH: u16 = 4001;
/// Close code sent when no `hello` arrives before the hello timeout.
pub const CLOSE_HELLO_TIMEOUT: u16 = 4002;

/// Gap reason used when a replay range fell out of backlog retention.
pub const GAP_REASON_EVICTED: &str = "evicted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidTerminalId,
    InvalidMessage,
    NotAuthenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalMode {
    /// Interactive login shell ($SHELL or the platform fallback chain).
    Shell,
    /// A specific argv, e.g. a build watcher or REPL.
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Running,
    Exited,
}

/// Snapshot row for session-overview UIs; returned by `terminal.list` and
/// pushed on `terminal.list.updated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSummary {
    pub terminal_id: String,
    pub mode: TerminalMode,
    pub status: TerminalStatus,
    pub head_seq: u64,
    pub clients: usize,
    pub created_at: DateTime<Utc>,
}

/// Messages sent from browser client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")]
    Hello { token: String },
    #[serde(rename = "terminal.create", rename_all = "camelCase")]
    TerminalCreate {
        request_id: String,
        mode: TerminalMode,
        #[serde(default)]
        shell: Option<String>,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    /// `last_seq` is the highest sequence number this client has already
    /// applied for the terminal, or 0 when it has no prior knowledge. The
    /// server computes the replay window from it.
    #[serde(rename = "terminal.attach", rename_all = "camelCase")]
    TerminalAttach {
        terminal_id: String,
        #[serde(default)]
        last_seq: u64,
    },
    #[serde(rename = "terminal.detach", rename_all = "camelCase")]
    TerminalDetach { terminal_id: String },
    #[serde(rename = "terminal.input", rename_all = "camelCase")]
    TerminalInput { terminal_id: String, data: String },
    #[serde(rename = "terminal.resize", rename_all = "camelCase")]
    TerminalResize {
        terminal_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "terminal.kill", rename_all = "camelCase")]
    TerminalKill { terminal_id: String },
    #[serde(rename = "terminal.list")]
    TerminalList,
    #[serde(rename = "ping")]
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

/// Messages sent from server to browser client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Authentication accepted; the connection is now in the Ready state.
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "terminal.created", rename_all = "camelCase")]
    TerminalCreated {
        request_id: String,
        terminal_id: String,
    },
    /// Attach handshake. `replay_from_seq > replay_to_seq` (or a 0/0 pair)
    /// means no replay follows and the client may jump straight to `head_seq`.
    /// `fresh_sequence` arms the client's one-time acceptance of a frame
    /// restarting at seq 1.
    #[serde(rename = "terminal.attach.ready", rename_all = "camelCase")]
    TerminalAttachReady {
        terminal_id: String,
        head_seq: u64,
        replay_from_seq: u64,
        replay_to_seq: u64,
        #[serde(default)]
        fresh_sequence: bool,
    },
    /// Rendered plain-text snapshot of the retained backlog, for
    /// non-interactive consumers. Not sequence-tagged; the byte stream
    /// authoritative for rendering is `terminal.output`.
    #[serde(rename = "terminal.attached", rename_all = "camelCase")]
    TerminalAttached {
        terminal_id: String,
        snapshot: String,
    },
    /// Start of a chunked replay unit. The reassembled chunks form a single
    /// sequence-tagged unit covering `[seq_start, seq_end]`.
    #[serde(rename = "terminal.attached.start", rename_all = "camelCase")]
    TerminalAttachedStart {
        terminal_id: String,
        total_chunks: usize,
        seq_start: u64,
        seq_end: u64,
    },
    #[serde(rename = "terminal.attached.chunk", rename_all = "camelCase")]
    TerminalAttachedChunk {
        terminal_id: String,
        index: usize,
        data: String,
    },
    #[serde(rename = "terminal.attached.end", rename_all = "camelCase")]
    TerminalAttachedEnd { terminal_id: String },
    #[serde(rename = "terminal.output", rename_all = "camelCase")]
    TerminalOutput {
        terminal_id: String,
        seq_start: u64,
        seq_end: u64,
        data: String,
    },
    /// The server cannot or will not deliver `[from_seq, to_seq]`.
    #[serde(rename = "terminal.output.gap", rename_all = "camelCase")]
    TerminalOutputGap {
        terminal_id: String,
        from_seq: u64,
        to_seq: u64,
        reason: String,
    },
    #[serde(rename = "terminal.detached", rename_all = "camelCase")]
    TerminalDetached { terminal_id: String },
    #[serde(rename = "terminal.exit", rename_all = "camelCase")]
    TerminalExit {
        terminal_id: String,
        exit_code: Option<i32>,
    },
    #[serde(rename = "terminal.list", rename_all = "camelCase")]
    TerminalList { terminals: Vec<TerminalSummary> },
    #[serde(rename = "terminal.list.updated", rename_all = "camelCase")]
    TerminalListUpdated { terminals: Vec<TerminalSummary> },
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_id: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            terminal_id: None,
        }
    }

    pub fn terminal_error(
        code: ErrorCode,
        message: impl Into<String>,
        terminal_id: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            terminal_id: Some(terminal_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_use_dotted_types_and_camel_case_fields() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"terminal.attach","terminalId":"t-abc","lastSeq":17}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::TerminalAttach {
                terminal_id,
                last_seq,
            } => {
                assert_eq!(terminal_id, "t-abc");
                assert_eq!(last_seq, 17);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn attach_last_seq_defaults_to_zero() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"terminal.attach","terminalId":"t-abc"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::TerminalAttach { last_seq: 0, .. }
        ));
    }

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ServerMessage::terminal_error(
            ErrorCode::InvalidTerminalId,
            "unknown terminal",
            "t-missing",
        ))
        .unwrap();
        assert!(json.contains(r#""code":"INVALID_TERMINAL_ID""#));
        assert!(json.contains(r#""terminalId":"t-missing""#));
    }

    #[test]
    fn attach_ready_round_trips() {
        let msg = ServerMessage::TerminalAttachReady {
            terminal_id: "t-1".into(),
            head_seq: 42,
            replay_from_seq: 6,
            replay_to_seq: 8,
            fresh_sequence: false,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"terminal.attach.ready""#));
        assert!(json.contains(r#""replayFromSeq":6"#));
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            ServerMessage::TerminalAttachReady { head_seq: 42, .. }
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parsed = serde_json::from_str::<ClientMessage>(r#"{"type":"terminal.explode"}"#);
        assert!(parsed.is_err());
    }
}
