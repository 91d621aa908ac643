//! Command mailbox and read response storage

use crate::protocol::{truncate_utf8, DEFAULT_READ_MESSAGE, MAX_COMMAND_LEN, MAX_READ_MESSAGE_LEN};

// ----------------------------------------------------------------------------
// Command Mailbox
// ----------------------------------------------------------------------------

/// Single-slot buffer holding the most recent inbound write
///
/// Every store overwrites the previous command. Draining copies the command
/// out and clears the slot in one step.
#[derive(Debug, Clone)]
pub struct CommandMailbox {
    buf: [u8; MAX_COMMAND_LEN + 1],
    len: usize,
}

impl Default for CommandMailbox {
    fn default() -> Self {
        Self {
            buf: [0; MAX_COMMAND_LEN + 1],
            len: 0,
        }
    }
}

impl CommandMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the slot with `payload`, truncated to 63 bytes.
    /// Returns the number of bytes kept.
    pub fn store(&mut self, payload: &[u8]) -> usize {
        let len = payload.len().min(MAX_COMMAND_LEN);
        self.buf[..len].copy_from_slice(&payload[..len]);
        self.buf[len] = 0;
        self.len = len;
        len
    }

    /// Continue a long write: keep the first `offset` bytes and place
    /// `payload` after them, truncated at 63 bytes. An offset of 0 is a plain
    /// store. Returns the number of payload bytes kept, or `None` when
    /// `offset` lies past the stored command.
    pub fn store_at(&mut self, offset: usize, payload: &[u8]) -> Option<usize> {
        if offset == 0 {
            return Some(self.store(payload));
        }
        if offset > self.len {
            return None;
        }
        let kept = payload.len().min(MAX_COMMAND_LEN - offset);
        self.buf[offset..offset + kept].copy_from_slice(&payload[..kept]);
        self.len = offset + kept;
        self.buf[self.len] = 0;
        Some(kept)
    }

    pub fn has_value(&self) -> bool {
        self.len > 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current command without consuming it
    pub fn peek(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Copy at most `out.len() - 1` bytes into `out`, NUL-terminate and clear.
    /// Returns the number of payload bytes copied; 0 leaves the slot untouched.
    pub fn drain_into(&mut self, out: &mut [u8]) -> usize {
        if self.len == 0 || out.is_empty() {
            return 0;
        }
        let n = self.len.min(out.len() - 1);
        out[..n].copy_from_slice(&self.buf[..n]);
        out[n] = 0;
        self.clear();
        n
    }

    /// Owned form of [`drain_into`](Self::drain_into) for a caller buffer of
    /// `capacity` bytes; the terminator is not included.
    pub fn take(&mut self, capacity: usize) -> Vec<u8> {
        if self.len == 0 || capacity == 0 {
            return Vec::new();
        }
        let n = self.len.min(capacity - 1);
        let out = self.buf[..n].to_vec();
        self.clear();
        out
    }

    pub fn clear(&mut self) {
        self.buf[0] = 0;
        self.len = 0;
    }
}

// ----------------------------------------------------------------------------
// Read Response
// ----------------------------------------------------------------------------

/// Message served by the read characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    message: String,
}

impl Default for ReadResponse {
    fn default() -> Self {
        Self {
            message: DEFAULT_READ_MESSAGE.to_string(),
        }
    }
}

impl ReadResponse {
    /// Replace the message; `None` or empty restores the default greeting
    pub fn set(&mut self, message: Option<&str>) {
        self.message = match message {
            Some(m) if !m.is_empty() => truncate_utf8(m, MAX_READ_MESSAGE_LEN).to_string(),
            _ => DEFAULT_READ_MESSAGE.to_string(),
        };
    }

    pub fn as_str(&self) -> &str {
        &self.message
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.message.as_bytes()
    }
}
