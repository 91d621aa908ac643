//! Stack events delivered from a backend to the peripheral state machine

use tokio::sync::mpsc;

/// Event raised by a backend when the stack changes state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    /// Host finished booting and accepts GAP/GATT operations
    Synced,
    /// Host lost sync with the controller
    Reset { reason: i32 },
    /// Connection attempt finished; `status != 0` is a failure
    Connected { status: u8, handle: u16 },
    /// Established link dropped
    Disconnected { handle: u16, reason: u8 },
}

impl StackEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Synced => "sync",
            Self::Reset { .. } => "reset",
            Self::Connected { .. } => "connect",
            Self::Disconnected { .. } => "disconnect",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<StackEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<StackEvent>;

/// Create the backend-to-state-machine event channel
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
