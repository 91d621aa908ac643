//! Peripheral lifecycle state and its transitions

use std::fmt;

use serde::Serialize;

use crate::error::{BleError, BleResult};
use crate::protocol::{truncate_utf8, DEFAULT_DEVICE_NAME, MAX_DEVICE_NAME_LEN};

// ----------------------------------------------------------------------------
// Device Name
// ----------------------------------------------------------------------------

/// Advertised device name: never empty, at most 31 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct DeviceName(String);

impl DeviceName {
    /// Build a name, truncating to 31 bytes on a character boundary.
    /// Empty input yields the default name.
    pub fn new(name: &str) -> BleResult<Self> {
        if name.contains('\0') {
            return Err(BleError::InvalidArgument(
                "device name must not contain NUL".to_string(),
            ));
        }
        let truncated = truncate_utf8(name, MAX_DEVICE_NAME_LEN);
        if truncated.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self(truncated.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for DeviceName {
    fn default() -> Self {
        Self(DEFAULT_DEVICE_NAME.to_string())
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Link State
// ----------------------------------------------------------------------------

/// Coarse lifecycle position derived from [`PeripheralState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Initializing,
    Ready,
    Advertising,
    Connected,
    Disconnected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Advertising => "advertising",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::Idle
    }
}

// ----------------------------------------------------------------------------
// Peripheral State
// ----------------------------------------------------------------------------

/// Single source of truth for the peripheral lifecycle
///
/// `advertising` is the advertising intent and survives a connection;
/// `connected` is what the stack last reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeripheralState {
    pub initialized: bool,
    pub host_synced: bool,
    pub advertising: bool,
    pub connected: bool,
    pub pending_advertise: bool,
    pub device_name: DeviceName,
    pub connection_handle: Option<u16>,
    pub last_disconnect_reason: Option<u8>,
}

impl PeripheralState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link_state(&self) -> LinkState {
        if !self.initialized {
            LinkState::Idle
        } else if !self.host_synced {
            LinkState::Initializing
        } else if self.connected {
            LinkState::Connected
        } else if self.advertising {
            LinkState::Advertising
        } else if self.last_disconnect_reason.is_some() {
            LinkState::Disconnected
        } else {
            LinkState::Ready
        }
    }

    /// Host became ready. Returns true when advertising must be started,
    /// either because a request was deferred or because it was active
    /// before a reset.
    pub fn record_sync(&mut self) -> bool {
        self.host_synced = true;
        let pending = std::mem::take(&mut self.pending_advertise);
        pending || self.advertising
    }

    /// Host lost sync. Advertising intent and pending requests survive so
    /// the next sync can honor them; the controller reset drops any link.
    pub fn record_reset(&mut self) {
        self.host_synced = false;
        self.connected = false;
        self.connection_handle = None;
    }

    /// Connection attempt finished. Returns true when advertising must be
    /// re-issued because the attempt failed while advertising was intended.
    pub fn record_connect(&mut self, status: u8, handle: u16) -> bool {
        if status == 0 {
            self.connected = true;
            self.connection_handle = Some(handle);
            self.last_disconnect_reason = None;
            false
        } else {
            self.connected = false;
            self.connection_handle = None;
            self.advertising
        }
    }

    /// Link dropped. Returns true when advertising must be re-issued.
    pub fn record_disconnect(&mut self, reason: u8) -> bool {
        self.connected = false;
        self.connection_handle = None;
        self.last_disconnect_reason = Some(reason);
        self.advertising
    }
}

/// Published view of the state after each transition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateSnapshot {
    pub state: PeripheralState,
    pub link: LinkState,
    pub events_processed: u64,
}

impl StateSnapshot {
    pub fn new(state: &PeripheralState, events_processed: u64) -> Self {
        Self {
            state: state.clone(),
            link: state.link_state(),
            events_processed,
        }
    }
}
