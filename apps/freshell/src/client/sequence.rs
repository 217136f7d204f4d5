//! Client-side sequence reconciliation.
//!
//! Every `terminal.output` frame carries an inclusive `[seq_start, seq_end]`
//! byte range. After a reconnect the server replays a promised window of
//! backlog, and the same socket then switches to live frames; this module
//! decides, frame by frame, whether a range is new data, a legitimate replay,
//! or a duplicate that must not be rendered twice. Pure values in, pure
//! values out; the transport adapter owns the I/O.

/// A promised replay range `[from_seq, to_seq]` from the attach handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    pub from_seq: u64,
    pub to_seq: u64,
}

/// The attach handshake fields the reconciler cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachReady {
    pub head_seq: u64,
    pub replay_from_seq: u64,
    pub replay_to_seq: u64,
    pub fresh_sequence: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequenceState {
    /// Highest sequence number consumed and applied, in order.
    pub last_seq: u64,
    /// Outstanding replay window; at most one is active at a time.
    pub pending_replay: Option<ReplayWindow>,
    /// Permits exactly one acceptance of a frame restarting at seq 1.
    pub awaiting_fresh_sequence: bool,
    attach_in_flight: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The range was already consumed and no replay window covers it.
    Overlap,
}

/// Decision for one inbound output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Accepted {
        state: SequenceState,
        /// True when this acceptance consumed the fresh-sequence exception;
        /// the renderer should reset before applying the frame.
        fresh_reset: bool,
    },
    Rejected { reason: RejectReason },
}

impl SequenceState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an attach as in flight. `last_seq` is untouched; prior knowledge
    /// survives until the handshake says otherwise.
    #[must_use]
    pub fn begin_attach(self) -> Self {
        Self {
            attach_in_flight: true,
            ..self
        }
    }

    pub fn attach_in_flight(&self) -> bool {
        self.attach_in_flight
    }

    /// Applies the attach handshake. An empty or already-covered replay range
    /// jumps `last_seq` forward to `head_seq`; otherwise the window is armed
    /// and `last_seq` is left alone so the replayed frames are not rejected
    /// as overlap.
    #[must_use]
    pub fn on_attach_ready(self, ready: AttachReady) -> Self {
        let AttachReady {
            head_seq,
            replay_from_seq,
            replay_to_seq,
            fresh_sequence,
        } = ready;

        let empty_range =
            replay_from_seq > replay_to_seq || (replay_from_seq == 0 && replay_to_seq == 0);
        let covered = self.last_seq >= replay_to_seq || self.last_seq >= head_seq;

        if fresh_sequence {
            return Self {
                pending_replay: None,
                awaiting_fresh_sequence: true,
                attach_in_flight: false,
                ..self
            };
        }

        if empty_range || covered {
            Self {
                last_seq: self.last_seq.max(head_seq),
                pending_replay: None,
                attach_in_flight: false,
                ..self
            }
        } else {
            Self {
                pending_replay: Some(ReplayWindow {
                    from_seq: replay_from_seq,
                    to_seq: replay_to_seq,
                }),
                attach_in_flight: false,
                ..self
            }
        }
    }

    /// Decides one `[seq_start, seq_end]` frame.
    #[must_use]
    pub fn on_output_frame(self, seq_start: u64, seq_end: u64) -> FrameOutcome {
        if self.awaiting_fresh_sequence && seq_start == 1 {
            // Single-use: the counter restarted server-side, accept the new
            // stream head once and return to strict ordering.
            return FrameOutcome::Accepted {
                state: Self {
                    last_seq: seq_end,
                    pending_replay: None,
                    awaiting_fresh_sequence: false,
                    ..self
                },
                fresh_reset: true,
            };
        }

        if let Some(window) = self.pending_replay {
            let within_or_abuts =
                seq_start >= window.from_seq && seq_start <= window.to_seq.saturating_add(1);
            if within_or_abuts {
                let consumed_tail = seq_end >= window.to_seq;
                return FrameOutcome::Accepted {
                    state: Self {
                        last_seq: self.last_seq.max(seq_end),
                        pending_replay: if consumed_tail { None } else { Some(window) },
                        ..self
                    },
                    fresh_reset: false,
                };
            }
        }

        if seq_start <= self.last_seq {
            return FrameOutcome::Rejected {
                reason: RejectReason::Overlap,
            };
        }

        FrameOutcome::Accepted {
            state: Self {
                last_seq: seq_end,
                ..self
            },
            fresh_reset: false,
        }
    }

    /// The server reports `[from_seq, to_seq]` will never be delivered.
    /// Forward progress is preserved: `last_seq` advances to the gap tail and
    /// never rewinds; a window whose tail the gap reaches is abandoned.
    #[must_use]
    pub fn on_output_gap(self, from_seq: u64, to_seq: u64) -> Self {
        let _ = from_seq;
        let clears_window = self
            .pending_replay
            .is_some_and(|window| to_seq >= window.to_seq);
        Self {
            last_seq: self.last_seq.max(to_seq),
            pending_replay: if clears_window {
                None
            } else {
                self.pending_replay
            },
            ..self
        }
    }
}
