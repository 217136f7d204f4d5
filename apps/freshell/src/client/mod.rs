pub mod sequence;
pub mod transport;

pub use sequence::{AttachReady, FrameOutcome, RejectReason, ReplayWindow, SequenceState};
pub use transport::{ClientEvent, ClientTransport};
