//! GATT attribute table and access callbacks
//!
//! The table holds two primary services:
//!
//! - Generic Access (0x1800) with the read-only Device Name (0x2A00)
//! - RustCam (0x1234) with a read characteristic (0x1235) serving the
//!   response message and a write characteristic (0x1236) feeding the
//!   command mailbox
//!
//! The table is built once per process. Handles come from a process-wide
//! counter and are never handed out twice.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::mailbox::{CommandMailbox, ReadResponse};
use crate::protocol::{
    CHARACTERISTIC_DECLARATION_UUID16, DEVICE_NAME_CHARACTERISTIC_UUID16, GAP_SERVICE_UUID16,
    PRIMARY_SERVICE_UUID16, RUSTCAM_READ_CHARACTERISTIC_UUID16, RUSTCAM_SERVICE_UUID16,
    RUSTCAM_WRITE_CHARACTERISTIC_UUID16,
};
use crate::state::DeviceName;

// ----------------------------------------------------------------------------
// Characteristic Properties
// ----------------------------------------------------------------------------

pub const PROP_READ: u8 = 0x02;
pub const PROP_WRITE_WITHOUT_RESPONSE: u8 = 0x04;
pub const PROP_WRITE: u8 = 0x08;

// ----------------------------------------------------------------------------
// Attribute Table
// ----------------------------------------------------------------------------

static NEXT_HANDLE: AtomicU16 = AtomicU16::new(1);
static REGISTRATIONS: AtomicUsize = AtomicUsize::new(0);
static TABLE: OnceLock<GattTable> = OnceLock::new();

fn next_handle() -> u16 {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// Which dynamic value a characteristic exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicRole {
    DeviceName,
    ReadMessage,
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Service and characteristic declarations
    Static(Vec<u8>),
    /// Characteristic value resolved on access
    Dynamic(CharacteristicRole),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub handle: u16,
    /// 16-bit attribute type
    pub att_type: u16,
    pub value: AttributeValue,
    pub readable: bool,
    pub writable: bool,
}

/// Handle range covered by one primary service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceRange {
    pub uuid16: u16,
    pub start: u16,
    pub end: u16,
}

/// Value handles of the three characteristics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattHandles {
    pub device_name: u16,
    pub read_message: u16,
    pub command: u16,
}

#[derive(Debug)]
pub struct GattTable {
    attributes: Vec<Attribute>,
    services: Vec<ServiceRange>,
    handles: GattHandles,
}

impl GattTable {
    fn build() -> Self {
        let mut attributes = Vec::with_capacity(8);
        let mut services = Vec::with_capacity(2);

        let gap_start = push_service(&mut attributes, GAP_SERVICE_UUID16);
        let device_name = push_characteristic(
            &mut attributes,
            DEVICE_NAME_CHARACTERISTIC_UUID16,
            PROP_READ,
            CharacteristicRole::DeviceName,
        );
        services.push(ServiceRange {
            uuid16: GAP_SERVICE_UUID16,
            start: gap_start,
            end: device_name,
        });

        let cam_start = push_service(&mut attributes, RUSTCAM_SERVICE_UUID16);
        let read_message = push_characteristic(
            &mut attributes,
            RUSTCAM_READ_CHARACTERISTIC_UUID16,
            PROP_READ,
            CharacteristicRole::ReadMessage,
        );
        let command = push_characteristic(
            &mut attributes,
            RUSTCAM_WRITE_CHARACTERISTIC_UUID16,
            PROP_WRITE | PROP_WRITE_WITHOUT_RESPONSE,
            CharacteristicRole::Command,
        );
        services.push(ServiceRange {
            uuid16: RUSTCAM_SERVICE_UUID16,
            start: cam_start,
            end: command,
        });

        Self {
            attributes,
            services,
            handles: GattHandles {
                device_name,
                read_message,
                command,
            },
        }
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, handle: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.handle == handle)
    }

    pub fn services(&self) -> &[ServiceRange] {
        &self.services
    }

    pub fn handles(&self) -> GattHandles {
        self.handles
    }
}

fn push_service(attributes: &mut Vec<Attribute>, uuid16: u16) -> u16 {
    let handle = next_handle();
    attributes.push(Attribute {
        handle,
        att_type: PRIMARY_SERVICE_UUID16,
        value: AttributeValue::Static(uuid16.to_le_bytes().to_vec()),
        readable: true,
        writable: false,
    });
    handle
}

fn push_characteristic(
    attributes: &mut Vec<Attribute>,
    uuid16: u16,
    properties: u8,
    role: CharacteristicRole,
) -> u16 {
    let decl_handle = next_handle();
    let value_handle = next_handle();

    let mut decl = Vec::with_capacity(5);
    decl.push(properties);
    decl.extend_from_slice(&value_handle.to_le_bytes());
    decl.extend_from_slice(&uuid16.to_le_bytes());

    attributes.push(Attribute {
        handle: decl_handle,
        att_type: CHARACTERISTIC_DECLARATION_UUID16,
        value: AttributeValue::Static(decl),
        readable: true,
        writable: false,
    });
    attributes.push(Attribute {
        handle: value_handle,
        att_type: uuid16,
        value: AttributeValue::Dynamic(role),
        readable: properties & PROP_READ != 0,
        writable: properties & (PROP_WRITE | PROP_WRITE_WITHOUT_RESPONSE) != 0,
    });
    value_handle
}

/// Register the attribute table. Later calls return the same table.
pub fn register() -> &'static GattTable {
    TABLE.get_or_init(|| {
        let table = GattTable::build();
        REGISTRATIONS.fetch_add(1, Ordering::SeqCst);
        info!(
            "GATT table registered: device name {}, read {}, write {}",
            table.handles.device_name, table.handles.read_message, table.handles.command
        );
        table
    })
}

/// The registered table, if any
pub fn registered() -> Option<&'static GattTable> {
    TABLE.get()
}

pub fn is_registered() -> bool {
    TABLE.get().is_some()
}

/// Number of times the table has actually been built
pub fn registration_count() -> usize {
    REGISTRATIONS.load(Ordering::SeqCst)
}

// ----------------------------------------------------------------------------
// Access Callbacks
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    #[error("Invalid attribute handle 0x{0:04X}")]
    InvalidHandle(u16),

    #[error("Attribute 0x{0:04X} is not readable")]
    ReadNotPermitted(u16),

    #[error("Attribute 0x{0:04X} is not writable")]
    WriteNotPermitted(u16),

    #[error("Offset {0} past the end of the value")]
    InvalidOffset(u16),

    #[error("GATT table not registered")]
    NotRegistered,
}

struct GattData {
    mailbox: CommandMailbox,
    response: ReadResponse,
    device_name: DeviceName,
}

/// Values behind the dynamic characteristics
///
/// Shared between the caller-facing API and the stack that serves
/// attribute accesses. Every access takes one short lock.
pub struct GattServer {
    data: Mutex<GattData>,
}

impl Default for GattServer {
    fn default() -> Self {
        Self::new()
    }
}

impl GattServer {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(GattData {
                mailbox: CommandMailbox::new(),
                response: ReadResponse::default(),
                device_name: DeviceName::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GattData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The registered table; accesses are rejected until `init` registers it
    pub fn table(&self) -> Result<&'static GattTable, AccessError> {
        registered().ok_or(AccessError::NotRegistered)
    }

    /// Read access callback
    pub fn read(&self, handle: u16) -> Result<Vec<u8>, AccessError> {
        let attribute = self
            .table()?
            .attribute(handle)
            .ok_or(AccessError::InvalidHandle(handle))?;
        if !attribute.readable {
            return Err(AccessError::ReadNotPermitted(handle));
        }
        let value = match &attribute.value {
            AttributeValue::Static(bytes) => bytes.clone(),
            AttributeValue::Dynamic(CharacteristicRole::DeviceName) => {
                self.lock().device_name.as_bytes().to_vec()
            }
            AttributeValue::Dynamic(CharacteristicRole::ReadMessage) => {
                let data = self.lock();
                debug!("GATT read: {}", data.response.as_str());
                data.response.as_bytes().to_vec()
            }
            AttributeValue::Dynamic(CharacteristicRole::Command) => {
                return Err(AccessError::ReadNotPermitted(handle))
            }
        };
        Ok(value)
    }

    /// Read starting at `offset`, for long reads split over several requests
    pub fn read_at(&self, handle: u16, offset: usize) -> Result<Vec<u8>, AccessError> {
        let mut value = self.read(handle)?;
        if offset > value.len() {
            return Err(AccessError::InvalidOffset(offset_code(offset)));
        }
        value.drain(..offset);
        Ok(value)
    }

    /// Write access callback. Oversized payloads are truncated silently.
    /// Returns the number of bytes stored.
    pub fn write(&self, handle: u16, payload: &[u8]) -> Result<usize, AccessError> {
        self.write_at(handle, 0, payload)
    }

    /// Write at `offset`. Offset 0 overwrites the mailbox; a later offset
    /// continues a long write whose earlier segments are already stored.
    pub fn write_at(
        &self,
        handle: u16,
        offset: usize,
        payload: &[u8],
    ) -> Result<usize, AccessError> {
        let attribute = self
            .table()?
            .attribute(handle)
            .ok_or(AccessError::InvalidHandle(handle))?;
        match attribute.value {
            AttributeValue::Dynamic(CharacteristicRole::Command) if attribute.writable => {
                let stored = self
                    .lock()
                    .mailbox
                    .store_at(offset, payload)
                    .ok_or(AccessError::InvalidOffset(offset_code(offset)))?;
                info!(
                    "GATT write: {} bytes at offset {} (stored {}): {}",
                    payload.len(),
                    offset,
                    stored,
                    hex::encode(&payload[..stored])
                );
                Ok(stored)
            }
            _ => Err(AccessError::WriteNotPermitted(handle)),
        }
    }

    pub fn set_read_message(&self, message: Option<&str>) {
        let mut data = self.lock();
        data.response.set(message);
        debug!("Read message set to: {}", data.response.as_str());
    }

    pub fn read_message(&self) -> String {
        self.lock().response.as_str().to_string()
    }

    pub fn set_device_name(&self, name: &DeviceName) {
        self.lock().device_name = name.clone();
    }

    pub fn device_name(&self) -> DeviceName {
        self.lock().device_name.clone()
    }

    /// Drain the mailbox for a caller buffer of `capacity` bytes
    pub fn poll_command(&self, capacity: usize) -> Vec<u8> {
        self.lock().mailbox.take(capacity)
    }

    /// Drain the mailbox into `out`, NUL-terminated
    pub fn poll_command_into(&self, out: &mut [u8]) -> usize {
        self.lock().mailbox.drain_into(out)
    }

    pub fn has_command(&self) -> bool {
        self.lock().mailbox.has_value()
    }

    pub fn pending_command_len(&self) -> usize {
        self.lock().mailbox.len()
    }
}

fn offset_code(offset: usize) -> u16 {
    u16::try_from(offset).unwrap_or(u16::MAX)
}
