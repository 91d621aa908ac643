//! BLE protocol constants and small value types for the RustCam peripheral

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

// ----------------------------------------------------------------------------
// GATT Service and Characteristic UUIDs
// ----------------------------------------------------------------------------

/// RustCam custom service (16-bit alias)
pub const RUSTCAM_SERVICE_UUID16: u16 = 0x1234;

/// Read characteristic returning the configurable response message
pub const RUSTCAM_READ_CHARACTERISTIC_UUID16: u16 = 0x1235;

/// Write characteristic feeding the command mailbox
pub const RUSTCAM_WRITE_CHARACTERISTIC_UUID16: u16 = 0x1236;

/// Generic Access service
pub const GAP_SERVICE_UUID16: u16 = 0x1800;

/// Device Name characteristic of the Generic Access service
pub const DEVICE_NAME_CHARACTERISTIC_UUID16: u16 = 0x2A00;

/// Attribute type of a primary service declaration
pub const PRIMARY_SERVICE_UUID16: u16 = 0x2800;

/// Attribute type of a characteristic declaration
pub const CHARACTERISTIC_DECLARATION_UUID16: u16 = 0x2803;

/// Bluetooth Base UUID (0000xxxx-0000-1000-8000-00805F9B34FB)
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16-bit alias into a full 128-bit UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// RustCam service UUID
pub const RUSTCAM_SERVICE_UUID: Uuid = uuid_from_u16(RUSTCAM_SERVICE_UUID16);

/// RustCam read characteristic UUID
pub const RUSTCAM_READ_CHARACTERISTIC_UUID: Uuid = uuid_from_u16(RUSTCAM_READ_CHARACTERISTIC_UUID16);

/// RustCam write characteristic UUID
pub const RUSTCAM_WRITE_CHARACTERISTIC_UUID: Uuid =
    uuid_from_u16(RUSTCAM_WRITE_CHARACTERISTIC_UUID16);

// ----------------------------------------------------------------------------
// Limits and Defaults
// ----------------------------------------------------------------------------

/// Maximum device name length in bytes
pub const MAX_DEVICE_NAME_LEN: usize = 31;

/// Maximum stored command length in bytes (excluding terminator)
pub const MAX_COMMAND_LEN: usize = 63;

/// Maximum read response length in bytes
pub const MAX_READ_MESSAGE_LEN: usize = 63;

/// Maximum legacy advertising payload size
pub const MAX_ADV_DATA_LEN: usize = 31;

/// Name advertised when the caller does not provide one
pub const DEFAULT_DEVICE_NAME: &str = "RustCam";

/// Message returned by the read characteristic until the caller sets one
pub const DEFAULT_READ_MESSAGE: &str = "Hello from RustCam!";

// ----------------------------------------------------------------------------
// Advertising Data Types
// ----------------------------------------------------------------------------

pub const AD_TYPE_FLAGS: u8 = 0x01;
pub const AD_TYPE_SHORTENED_LOCAL_NAME: u8 = 0x08;
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// LE General Discoverable Mode
pub const AD_FLAG_LE_GENERAL_DISCOVERABLE: u8 = 0x02;

/// BR/EDR Not Supported
pub const AD_FLAG_BR_EDR_NOT_SUPPORTED: u8 = 0x04;

/// Truncate `s` to at most `max` bytes without splitting a UTF-8 sequence
pub fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ----------------------------------------------------------------------------
// Bluetooth Device Address
// ----------------------------------------------------------------------------

/// Bluetooth device address, stored most significant byte first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr(pub [u8; 6]);

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Error returned when an address string is not `XX:XX:XX:XX:XX:XX`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid Bluetooth address: {0}")]
pub struct ParseBdAddrError(String);

impl FromStr for BdAddr {
    type Err = ParseBdAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseBdAddrError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseBdAddrError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseBdAddrError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseBdAddrError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}
