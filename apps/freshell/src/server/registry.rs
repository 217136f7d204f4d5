//! Terminal session registry: one record per PTY-backed process, a bounded
//! sequence-numbered output backlog, and the set of attached viewer
//! connections. The backlog outlives attachments, so a client that
//! disconnects and reattaches can still catch up within the retention limit.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    ServerMessage, TerminalMode, TerminalStatus, TerminalSummary, GAP_REASON_EVICTED,
};
use crate::server::pty::{self, PtyProcess};
use crate::terminal::{render, RenderOptions};

pub type ConnId = u64;

/// Frames queued to one connection's writer task. Sends are fire-and-forget;
/// a closed receiver is logged and never blocks other connections.
#[derive(Debug)]
pub enum Outbound {
    Message(ServerMessage),
    Close { code: u16, reason: String },
}

pub type ClientTx = mpsc::UnboundedSender<Outbound>;

fn send_or_log(conn_id: ConnId, tx: &ClientTx, message: ServerMessage) {
    if tx.send(Outbound::Message(message)).is_err() {
        debug!(conn_id, "dropped frame for closed connection");
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub backlog_max_bytes: usize,
    pub snapshot_chunk_bytes: usize,
    pub exited_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backlog_max_bytes: 2 * 1024 * 1024,
            snapshot_chunk_bytes: 64 * 1024,
            exited_grace: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub mode: TerminalMode,
    pub shell: Option<String>,
    pub command: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            mode: TerminalMode::Shell,
            shell: None,
            command: Vec::new(),
            cwd: None,
            cols: 80,
            rows: 24,
        }
    }
}

struct BacklogChunk {
    seq_start: u64,
    seq_end: u64,
    data: Bytes,
}

/// Bounded, ordered output history. Appended at the tail, evicted from the
/// head; evicted ranges are no longer replayable.
struct Backlog {
    chunks: VecDeque<BacklogChunk>,
    bytes: usize,
    max_bytes: usize,
}

impl Backlog {
    fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            max_bytes,
        }
    }

    fn push(&mut self, seq_start: u64, data: Bytes) {
        let seq_end = seq_start + data.len() as u64 - 1;
        self.bytes += data.len();
        self.chunks.push_back(BacklogChunk {
            seq_start,
            seq_end,
            data,
        });
        // Always retain the newest chunk, even when it alone exceeds budget.
        while self.bytes > self.max_bytes && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.data.len();
            }
        }
    }

    fn oldest_retained(&self) -> Option<u64> {
        self.chunks.front().map(|chunk| chunk.seq_start)
    }

    /// Chunks covering `from_seq..`, with the first one trimmed to start at
    /// `from_seq` when it straddles the boundary.
    fn frames_from(&self, from_seq: u64) -> Vec<(u64, u64, Bytes)> {
        let mut frames = Vec::new();
        for chunk in &self.chunks {
            if chunk.seq_end < from_seq {
                continue;
            }
            if chunk.seq_start >= from_seq {
                frames.push((chunk.seq_start, chunk.seq_end, chunk.data.clone()));
            } else {
                let offset = (from_seq - chunk.seq_start) as usize;
                frames.push((from_seq, chunk.seq_end, chunk.data.slice(offset..)));
            }
        }
        frames
    }

    fn snapshot_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }
}

struct ExitInfo {
    exit_code: Option<i32>,
    error: Option<String>,
}

struct RecordState {
    status: TerminalStatus,
    head_seq: u64,
    backlog: Backlog,
    clients: HashMap<ConnId, ClientTx>,
    process: Option<PtyProcess>,
    exit: Option<ExitInfo>,
    exited_at: Option<Instant>,
}

/// One terminal: exclusively-owned process, backlog, attached viewers.
pub struct TerminalRecord {
    terminal_id: String,
    mode: TerminalMode,
    created_at: DateTime<Utc>,
    state: Mutex<RecordState>,
}

impl TerminalRecord {
    fn new(terminal_id: String, mode: TerminalMode, backlog_max_bytes: usize) -> Self {
        Self {
            terminal_id,
            mode,
            created_at: Utc::now(),
            state: Mutex::new(RecordState {
                status: TerminalStatus::Running,
                head_seq: 0,
                backlog: Backlog::new(backlog_max_bytes),
                clients: HashMap::new(),
                process: None,
                exit: None,
                exited_at: None,
            }),
        }
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn head_seq(&self) -> u64 {
        self.state.lock().head_seq
    }

    pub fn status(&self) -> TerminalStatus {
        self.state.lock().status
    }

    pub fn exit_error(&self) -> Option<String> {
        self.state
            .lock()
            .exit
            .as_ref()
            .and_then(|exit| exit.error.clone())
    }

    pub fn summary(&self) -> TerminalSummary {
        let state = self.state.lock();
        TerminalSummary {
            terminal_id: self.terminal_id.clone(),
            mode: self.mode,
            status: state.status,
            head_seq: state.head_seq,
            clients: state.clients.len(),
            created_at: self.created_at,
        }
    }

    /// Appends process output and fans it out to every attached connection.
    /// The sequence counter counts bytes; each chunk covers
    /// `[head_seq + 1, head_seq + len]`.
    fn ingest(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let seq_start = state.head_seq + 1;
        state.head_seq += data.len() as u64;
        let seq_end = state.head_seq;
        state.backlog.push(seq_start, Bytes::copy_from_slice(data));

        let text = String::from_utf8_lossy(data).into_owned();
        for (conn_id, tx) in &state.clients {
            send_or_log(
                *conn_id,
                tx,
                ServerMessage::TerminalOutput {
                    terminal_id: self.terminal_id.clone(),
                    seq_start,
                    seq_end,
                    data: text.clone(),
                },
            );
        }
    }

    /// Adds the connection to the viewer set and runs the attach handshake
    /// under the record lock, so no live frame can interleave before the
    /// replay is queued: ready, optional gap, replay data, rendered snapshot.
    fn attach(&self, conn_id: ConnId, tx: &ClientTx, last_seq: u64, chunk_bytes: usize) {
        let mut state = self.state.lock();
        let head_seq = state.head_seq;
        let oldest = state.backlog.oldest_retained();

        let mut fresh_sequence = false;
        let mut gap = None;
        let (replay_from_seq, replay_to_seq) = if last_seq >= head_seq {
            // Nothing to replay. A client claiming more than we ever emitted
            // has state from a previous life of the counter.
            fresh_sequence = last_seq > head_seq;
            (0, 0)
        } else if let Some(oldest) = oldest {
            if last_seq + 1 < oldest {
                gap = Some((last_seq + 1, oldest - 1));
                (oldest, head_seq)
            } else {
                (last_seq + 1, head_seq)
            }
        } else {
            // The entire backlog has been evicted; the client can only jump
            // to the frontier.
            (0, 0)
        };

        state.clients.insert(conn_id, tx.clone());

        send_or_log(
            conn_id,
            tx,
            ServerMessage::TerminalAttachReady {
                terminal_id: self.terminal_id.clone(),
                head_seq,
                replay_from_seq,
                replay_to_seq,
                fresh_sequence,
            },
        );

        if let Some((from_seq, to_seq)) = gap {
            send_or_log(
                conn_id,
                tx,
                ServerMessage::TerminalOutputGap {
                    terminal_id: self.terminal_id.clone(),
                    from_seq,
                    to_seq,
                    reason: GAP_REASON_EVICTED.to_string(),
                },
            );
        }

        if replay_from_seq >= 1 && replay_from_seq <= replay_to_seq {
            let frames = state.backlog.frames_from(replay_from_seq);
            let total_bytes: usize = frames.iter().map(|(_, _, data)| data.len()).sum();
            if total_bytes > chunk_bytes {
                let mut unit = Vec::with_capacity(total_bytes);
                for (_, _, data) in &frames {
                    unit.extend_from_slice(data);
                }
                let pieces: Vec<&[u8]> = unit.chunks(chunk_bytes).collect();
                send_or_log(
                    conn_id,
                    tx,
                    ServerMessage::TerminalAttachedStart {
                        terminal_id: self.terminal_id.clone(),
                        total_chunks: pieces.len(),
                        seq_start: replay_from_seq,
                        seq_end: replay_to_seq,
                    },
                );
                for (index, piece) in pieces.iter().enumerate() {
                    send_or_log(
                        conn_id,
                        tx,
                        ServerMessage::TerminalAttachedChunk {
                            terminal_id: self.terminal_id.clone(),
                            index,
                            data: String::from_utf8_lossy(piece).into_owned(),
                        },
                    );
                }
                send_or_log(
                    conn_id,
                    tx,
                    ServerMessage::TerminalAttachedEnd {
                        terminal_id: self.terminal_id.clone(),
                    },
                );
            } else {
                for (seq_start, seq_end, data) in frames {
                    send_or_log(
                        conn_id,
                        tx,
                        ServerMessage::TerminalOutput {
                            terminal_id: self.terminal_id.clone(),
                            seq_start,
                            seq_end,
                            data: String::from_utf8_lossy(&data).into_owned(),
                        },
                    );
                }
            }
        }

        let snapshot_bytes = state.backlog.snapshot_bytes();
        let snapshot = render(
            &String::from_utf8_lossy(&snapshot_bytes),
            &RenderOptions::default(),
        );
        send_or_log(
            conn_id,
            tx,
            ServerMessage::TerminalAttached {
                terminal_id: self.terminal_id.clone(),
                snapshot,
            },
        );
    }

    fn detach(&self, conn_id: ConnId) {
        self.state.lock().clients.remove(&conn_id);
    }

    fn take_process(&self) -> Option<PtyProcess> {
        self.state.lock().process.take()
    }
}

pub struct TerminalRegistry {
    terminals: DashMap<String, Arc<TerminalRecord>>,
    /// Ready connections interested in `terminal.list.updated` pushes,
    /// attached or not.
    watchers: DashMap<ConnId, ClientTx>,
    config: RegistryConfig,
}

impl TerminalRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            terminals: DashMap::new(),
            watchers: DashMap::new(),
            config,
        }
    }

    /// Allocates a terminal id and spawns the backing process. Never fails
    /// for valid options: a spawn error yields a record already in the
    /// `exited` state carrying the error, so callers can still reference it.
    pub fn create(self: &Arc<Self>, options: CreateOptions) -> Arc<TerminalRecord> {
        let terminal_id = format!("t-{}", Uuid::new_v4().simple());
        let record = Arc::new(TerminalRecord::new(
            terminal_id.clone(),
            options.mode,
            self.config.backlog_max_bytes,
        ));

        let spec = pty::spawn_spec(
            options.mode,
            options.shell.as_deref(),
            &options.command,
            options.cwd.as_deref(),
        );
        match PtyProcess::spawn(&spec, options.cols, options.rows) {
            Ok((process, reader)) => {
                record.state.lock().process = Some(process);
                spawn_output_pump(self.clone(), record.clone(), reader);
                info!(terminal_id = %terminal_id, file = %spec.file, "terminal created");
            }
            Err(err) => {
                warn!(terminal_id = %terminal_id, error = %err, "terminal spawn failed");
                let mut state = record.state.lock();
                state.status = TerminalStatus::Exited;
                state.exit = Some(ExitInfo {
                    exit_code: None,
                    error: Some(err.to_string()),
                });
                state.exited_at = Some(Instant::now());
            }
        }

        self.terminals.insert(terminal_id, record.clone());
        self.broadcast_list_updated();
        record
    }

    /// Runs the attach handshake and joins `conn_id` to the broadcast set.
    /// Returns false for an unknown terminal id.
    pub fn attach(&self, terminal_id: &str, conn_id: ConnId, tx: &ClientTx, last_seq: u64) -> bool {
        let Some(record) = self.get(terminal_id) else {
            return false;
        };
        record.attach(conn_id, tx, last_seq, self.config.snapshot_chunk_bytes);
        self.broadcast_list_updated();
        true
    }

    /// Idempotent. Returns false only for an unknown terminal id.
    pub fn detach(&self, terminal_id: &str, conn_id: ConnId) -> bool {
        let Some(record) = self.get(terminal_id) else {
            return false;
        };
        record.detach(conn_id);
        self.broadcast_list_updated();
        true
    }

    /// Fire-and-forget write to the process stdin; a PTY applies its own
    /// buffering, so no backpressure is reported to the caller.
    pub fn input(&self, terminal_id: &str, data: &[u8]) -> bool {
        let Some(record) = self.get(terminal_id) else {
            return false;
        };
        let state = record.state.lock();
        if let Some(process) = &state.process {
            if let Err(err) = process.write(data) {
                warn!(terminal_id = %terminal_id, error = %err, "pty write failed");
            }
        }
        true
    }

    pub fn resize(&self, terminal_id: &str, cols: u16, rows: u16) -> bool {
        let Some(record) = self.get(terminal_id) else {
            return false;
        };
        let state = record.state.lock();
        if let Some(process) = &state.process {
            if let Err(err) = process.resize(cols, rows) {
                warn!(terminal_id = %terminal_id, error = %err, "pty resize failed");
            }
        }
        true
    }

    /// Terminates the process and removes the record. Attached viewers see
    /// `terminal.exit` before the record disappears from list results.
    pub fn kill(&self, terminal_id: &str) -> bool {
        let Some(record) = self.get(terminal_id) else {
            return false;
        };

        let (viewer_txs, process, already_exited) = {
            let mut state = record.state.lock();
            let already_exited = state.status == TerminalStatus::Exited;
            state.status = TerminalStatus::Exited;
            if state.exited_at.is_none() {
                state.exited_at = Some(Instant::now());
            }
            let txs: Vec<(ConnId, ClientTx)> = state
                .clients
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect();
            (txs, state.process.take(), already_exited)
        };

        if let Some(process) = process {
            process.kill();
        }

        if !already_exited {
            for (conn_id, tx) in &viewer_txs {
                send_or_log(
                    *conn_id,
                    tx,
                    ServerMessage::TerminalExit {
                        terminal_id: terminal_id.to_string(),
                        exit_code: None,
                    },
                );
            }
        }

        self.terminals.remove(terminal_id);
        info!(terminal_id = %terminal_id, "terminal killed");
        self.broadcast_list_updated();
        true
    }

    pub fn list(&self) -> Vec<TerminalSummary> {
        self.terminals
            .iter()
            .map(|entry| entry.value().summary())
            .collect()
    }

    pub fn get(&self, terminal_id: &str) -> Option<Arc<TerminalRecord>> {
        self.terminals
            .get(terminal_id)
            .map(|entry| entry.value().clone())
    }

    pub fn register_watcher(&self, conn_id: ConnId, tx: ClientTx) {
        self.watchers.insert(conn_id, tx);
    }

    pub fn unregister_watcher(&self, conn_id: ConnId) {
        self.watchers.remove(&conn_id);
    }

    fn broadcast_list_updated(&self) {
        let terminals = self.list();
        for entry in self.watchers.iter() {
            send_or_log(
                *entry.key(),
                entry.value(),
                ServerMessage::TerminalListUpdated {
                    terminals: terminals.clone(),
                },
            );
        }
    }

    /// Marks a record exited after its process ended on its own; no-op when
    /// `kill` got there first.
    fn mark_exited(&self, record: &TerminalRecord, exit_code: Option<i32>) {
        let viewer_txs = {
            let mut state = record.state.lock();
            if state.status == TerminalStatus::Exited {
                return;
            }
            state.status = TerminalStatus::Exited;
            state.exit = Some(ExitInfo {
                exit_code,
                error: None,
            });
            state.exited_at = Some(Instant::now());
            state
                .clients
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect::<Vec<_>>()
        };

        info!(terminal_id = %record.terminal_id, exit_code, "terminal exited");
        for (conn_id, tx) in &viewer_txs {
            send_or_log(
                *conn_id,
                tx,
                ServerMessage::TerminalExit {
                    terminal_id: record.terminal_id.clone(),
                    exit_code,
                },
            );
        }
        self.broadcast_list_updated();
    }

    /// Removes exited records nobody is attached to once the grace period
    /// has passed. The backlog of a freshly-exited terminal stays attachable
    /// until then, so a reconnecting client can read the tail.
    pub fn sweep_exited(&self) {
        let grace = self.config.exited_grace;
        let mut expired = Vec::new();
        for entry in self.terminals.iter() {
            let state = entry.value().state.lock();
            if state.status == TerminalStatus::Exited
                && state.clients.is_empty()
                && state
                    .exited_at
                    .map_or(false, |exited_at| exited_at.elapsed() > grace)
            {
                expired.push(entry.key().clone());
            }
        }
        if expired.is_empty() {
            return;
        }
        for terminal_id in &expired {
            self.terminals.remove(terminal_id);
            debug!(terminal_id = %terminal_id, "evicted idle exited terminal");
        }
        self.broadcast_list_updated();
    }

    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                registry.sweep_exited();
            }
        })
    }
}

fn spawn_output_pump(
    registry: Arc<TerminalRegistry>,
    record: Arc<TerminalRecord>,
    mut reader: Box<dyn Read + Send>,
) {
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => record.ingest(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(terminal_id = %record.terminal_id, error = %err, "pty read ended");
                    break;
                }
            }
        }
        // EOF: reap the child unless kill() already took it.
        let exit_code = record
            .take_process()
            .as_ref()
            .and_then(|process| process.wait_exit_code());
        registry.mark_exited(&record, exit_code);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_registry(config: RegistryConfig) -> Arc<TerminalRegistry> {
        Arc::new(TerminalRegistry::new(config))
    }

    /// Inserts a record with no backing process so output can be driven
    /// deterministically through `ingest`.
    fn insert_unspawned(registry: &TerminalRegistry, terminal_id: &str) -> Arc<TerminalRecord> {
        let record = Arc::new(TerminalRecord::new(
            terminal_id.to_string(),
            TerminalMode::Shell,
            registry.config.backlog_max_bytes,
        ));
        registry
            .terminals
            .insert(terminal_id.to_string(), record.clone());
        record
    }

    fn channel() -> (ClientTx, UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let Outbound::Message(msg) = msg {
                out.push(msg);
            }
        }
        out
    }

    #[test]
    fn backlog_assigns_contiguous_byte_ranges() {
        let mut backlog = Backlog::new(1024);
        backlog.push(1, Bytes::from_static(b"hello"));
        backlog.push(6, Bytes::from_static(b" world"));
        assert_eq!(backlog.oldest_retained(), Some(1));
        let frames = backlog.frames_from(1);
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].0, frames[0].1), (1, 5));
        assert_eq!((frames[1].0, frames[1].1), (6, 11));
    }

    #[test]
    fn backlog_evicts_oldest_when_over_budget() {
        let mut backlog = Backlog::new(10);
        backlog.push(1, Bytes::from_static(b"aaaaa"));
        backlog.push(6, Bytes::from_static(b"bbbbb"));
        backlog.push(11, Bytes::from_static(b"ccccc"));
        assert_eq!(backlog.oldest_retained(), Some(6));
        assert!(backlog.bytes <= 10);
    }

    #[test]
    fn backlog_always_retains_the_newest_chunk() {
        let mut backlog = Backlog::new(4);
        backlog.push(1, Bytes::from_static(b"oversized chunk"));
        assert_eq!(backlog.oldest_retained(), Some(1));
    }

    #[test]
    fn frames_from_splits_a_straddling_chunk() {
        let mut backlog = Backlog::new(1024);
        backlog.push(1, Bytes::from_static(b"abcdefgh"));
        let frames = backlog.frames_from(4);
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].0, frames[0].1), (4, 8));
        assert_eq!(&frames[0].2[..], b"defgh");
    }

    #[test]
    fn attach_with_no_prior_knowledge_replays_retained_backlog() {
        let registry = test_registry(RegistryConfig::default());
        let record = insert_unspawned(&registry, "t-test");
        record.ingest(b"one");
        record.ingest(b"two");

        let (tx, mut rx) = channel();
        assert!(registry.attach("t-test", 1, &tx, 0));

        let messages = drain(&mut rx);
        match &messages[0] {
            ServerMessage::TerminalAttachReady {
                head_seq,
                replay_from_seq,
                replay_to_seq,
                fresh_sequence,
                ..
            } => {
                assert_eq!(*head_seq, 6);
                assert_eq!(*replay_from_seq, 1);
                assert_eq!(*replay_to_seq, 6);
                assert!(!fresh_sequence);
            }
            other => panic!("expected attach.ready, got {other:?}"),
        }
        let outputs: Vec<_> = messages
            .iter()
            .filter_map(|msg| match msg {
                ServerMessage::TerminalOutput {
                    seq_start,
                    seq_end,
                    data,
                    ..
                } => Some((*seq_start, *seq_end, data.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            outputs,
            vec![(1, 3, "one".to_string()), (4, 6, "two".to_string())]
        );
        assert!(messages
            .iter()
            .any(|msg| matches!(msg, ServerMessage::TerminalAttached { snapshot, .. } if snapshot == "onetwo")));
    }

    #[test]
    fn attach_with_partial_knowledge_replays_the_suffix() {
        let registry = test_registry(RegistryConfig::default());
        let record = insert_unspawned(&registry, "t-test");
        record.ingest(b"abcdefgh");

        let (tx, mut rx) = channel();
        assert!(registry.attach("t-test", 1, &tx, 5));

        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            ServerMessage::TerminalAttachReady {
                replay_from_seq: 6,
                replay_to_seq: 8,
                ..
            }
        ));
        assert!(messages.iter().any(|msg| matches!(
            msg,
            ServerMessage::TerminalOutput {
                seq_start: 6,
                seq_end: 8,
                ..
            }
        )));
    }

    #[test]
    fn attach_up_to_date_needs_no_replay() {
        let registry = test_registry(RegistryConfig::default());
        let record = insert_unspawned(&registry, "t-test");
        record.ingest(b"abc");

        let (tx, mut rx) = channel();
        assert!(registry.attach("t-test", 1, &tx, 3));
        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            ServerMessage::TerminalAttachReady {
                head_seq: 3,
                replay_from_seq: 0,
                replay_to_seq: 0,
                fresh_sequence: false,
                ..
            }
        ));
        assert!(!messages
            .iter()
            .any(|msg| matches!(msg, ServerMessage::TerminalOutput { .. })));
    }

    #[test]
    fn attach_after_eviction_reports_a_gap_before_the_replay() {
        let registry = test_registry(RegistryConfig {
            backlog_max_bytes: 10,
            ..RegistryConfig::default()
        });
        let record = insert_unspawned(&registry, "t-test");
        record.ingest(b"aaaaa"); // [1,5], evicted below
        record.ingest(b"bbbbb"); // [6,10]
        record.ingest(b"ccccc"); // [11,15]

        let (tx, mut rx) = channel();
        assert!(registry.attach("t-test", 1, &tx, 2));

        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            ServerMessage::TerminalAttachReady {
                replay_from_seq: 6,
                replay_to_seq: 15,
                ..
            }
        ));
        assert!(matches!(
            &messages[1],
            ServerMessage::TerminalOutputGap {
                from_seq: 3,
                to_seq: 5,
                reason,
                ..
            } if reason.as_str() == GAP_REASON_EVICTED
        ));
    }

    #[test]
    fn attach_ahead_of_head_signals_fresh_sequence() {
        let registry = test_registry(RegistryConfig::default());
        let record = insert_unspawned(&registry, "t-test");
        record.ingest(b"ab");

        let (tx, mut rx) = channel();
        assert!(registry.attach("t-test", 1, &tx, 40));
        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            ServerMessage::TerminalAttachReady {
                head_seq: 2,
                fresh_sequence: true,
                ..
            }
        ));
    }

    #[test]
    fn large_replay_is_delivered_as_one_chunked_unit() {
        let registry = test_registry(RegistryConfig {
            snapshot_chunk_bytes: 4,
            ..RegistryConfig::default()
        });
        let record = insert_unspawned(&registry, "t-test");
        record.ingest(b"0123456789");

        let (tx, mut rx) = channel();
        assert!(registry.attach("t-test", 1, &tx, 0));
        let messages = drain(&mut rx);

        let start = messages
            .iter()
            .find_map(|msg| match msg {
                ServerMessage::TerminalAttachedStart {
                    total_chunks,
                    seq_start,
                    seq_end,
                    ..
                } => Some((*total_chunks, *seq_start, *seq_end)),
                _ => None,
            })
            .expect("expected chunked delivery");
        assert_eq!(start, (3, 1, 10));

        let chunks: Vec<_> = messages
            .iter()
            .filter_map(|msg| match msg {
                ServerMessage::TerminalAttachedChunk { index, data, .. } => {
                    Some((*index, data.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 3);
        let reassembled: String = chunks.iter().map(|(_, data)| data.as_str()).collect();
        assert_eq!(reassembled, "0123456789");
        assert!(messages
            .iter()
            .any(|msg| matches!(msg, ServerMessage::TerminalAttachedEnd { .. })));
        // No plain output frames for a chunked replay.
        assert!(!messages
            .iter()
            .any(|msg| matches!(msg, ServerMessage::TerminalOutput { .. })));
    }

    #[test]
    fn live_output_fans_out_to_all_attached_connections() {
        let registry = test_registry(RegistryConfig::default());
        let record = insert_unspawned(&registry, "t-test");

        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.attach("t-test", 1, &tx1, 0);
        registry.attach("t-test", 2, &tx2, 0);
        drain(&mut rx1);
        drain(&mut rx2);

        record.ingest(b"xyz");
        for rx in [&mut rx1, &mut rx2] {
            let messages = drain(rx);
            assert!(messages.iter().any(|msg| matches!(
                msg,
                ServerMessage::TerminalOutput {
                    seq_start: 1,
                    seq_end: 3,
                    ..
                }
            )));
        }
    }

    #[test]
    fn dead_connection_does_not_block_the_others() {
        let registry = test_registry(RegistryConfig::default());
        let record = insert_unspawned(&registry, "t-test");

        let (tx1, rx1) = channel();
        let (tx2, mut rx2) = channel();
        registry.attach("t-test", 1, &tx1, 0);
        registry.attach("t-test", 2, &tx2, 0);
        drop(rx1);
        drain(&mut rx2);

        record.ingest(b"still flowing");
        assert!(drain(&mut rx2)
            .iter()
            .any(|msg| matches!(msg, ServerMessage::TerminalOutput { .. })));
    }

    #[test]
    fn detach_is_idempotent_and_unknown_ids_are_reported() {
        let registry = test_registry(RegistryConfig::default());
        insert_unspawned(&registry, "t-test");
        let (tx, _rx) = channel();
        registry.attach("t-test", 1, &tx, 0);

        assert!(registry.detach("t-test", 1));
        assert!(registry.detach("t-test", 1));
        assert!(!registry.detach("t-gone", 1));
        assert!(!registry.attach("t-gone", 1, &tx, 0));
        assert!(!registry.input("t-gone", b"x"));
        assert!(!registry.resize("t-gone", 80, 24));
        assert!(!registry.kill("t-gone"));
    }

    #[test]
    fn kill_notifies_viewers_and_watchers_before_removal() {
        let registry = test_registry(RegistryConfig::default());
        insert_unspawned(&registry, "t-test");

        let (viewer_tx, mut viewer_rx) = channel();
        registry.attach("t-test", 1, &viewer_tx, 0);
        drain(&mut viewer_rx);

        let (watcher_tx, mut watcher_rx) = channel();
        registry.register_watcher(7, watcher_tx);

        assert!(registry.kill("t-test"));
        assert!(registry.list().is_empty());

        assert!(drain(&mut viewer_rx)
            .iter()
            .any(|msg| matches!(msg, ServerMessage::TerminalExit { .. })));
        let watcher_msgs = drain(&mut watcher_rx);
        assert!(watcher_msgs.iter().any(|msg| matches!(
            msg,
            ServerMessage::TerminalListUpdated { terminals } if terminals.is_empty()
        )));
    }

    #[test]
    fn sweep_removes_exited_unattached_records_after_grace() {
        let registry = test_registry(RegistryConfig {
            exited_grace: Duration::from_secs(0),
            ..RegistryConfig::default()
        });
        let record = insert_unspawned(&registry, "t-test");
        {
            let mut state = record.state.lock();
            state.status = TerminalStatus::Exited;
            state.exited_at = Some(Instant::now() - Duration::from_secs(1));
        }
        registry.sweep_exited();
        assert!(registry.get("t-test").is_none());
    }

    #[test]
    fn sweep_keeps_records_with_attached_viewers() {
        let registry = test_registry(RegistryConfig {
            exited_grace: Duration::from_secs(0),
            ..RegistryConfig::default()
        });
        let record = insert_unspawned(&registry, "t-test");
        let (tx, _rx) = channel();
        registry.attach("t-test", 1, &tx, 0);
        {
            let mut state = record.state.lock();
            state.status = TerminalStatus::Exited;
            state.exited_at = Some(Instant::now() - Duration::from_secs(1));
        }
        registry.sweep_exited();
        assert!(registry.get("t-test").is_some());
    }
}
