//! HCI command codec and transport seam
//!
//! Packets use the H4 framing that Linux HCI sockets expose: one packet
//! type byte followed by the command or event body. Only the command and
//! completion events the kernel-native control path needs are decoded.

use std::io;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use crate::advertising::AdvertisingData;
use crate::error::{BleError, BleResult};
use crate::protocol::MAX_ADV_DATA_LEN;

// ----------------------------------------------------------------------------
// Packet Types and Opcodes
// ----------------------------------------------------------------------------

pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_EVENT_PKT: u8 = 0x04;

// OGF << 10 | OCF
pub const HCI_OP_LE_SET_ADV_PARAM: u16 = 0x2006;
pub const HCI_OP_LE_SET_ADV_DATA: u16 = 0x2008;
pub const HCI_OP_LE_SET_ADV_ENABLE: u16 = 0x200A;

pub const HCI_EV_CMD_COMPLETE: u8 = 0x0E;
pub const HCI_EV_CMD_STATUS: u8 = 0x0F;

pub const ADV_TYPE_IND: u8 = 0x00;
pub const OWN_ADDR_PUBLIC: u8 = 0x00;
pub const ADV_CHANNEL_ALL: u8 = 0x07;

/// Largest H4 packet a controller may deliver
pub const MAX_PACKET_LEN: usize = 1024;

// ----------------------------------------------------------------------------
// Packet Builders
// ----------------------------------------------------------------------------

/// H4 command packet
pub fn command_packet(opcode: u16, params: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(4 + params.len());
    pkt.push(HCI_COMMAND_PKT);
    pkt.extend_from_slice(&opcode.to_le_bytes());
    pkt.push(params.len() as u8);
    pkt.extend_from_slice(params);
    pkt
}

/// LE Set Advertising Parameters: connectable undirected, all channels,
/// no filter policy, min and max interval both `interval_units`
pub fn adv_params(interval_units: u16, own_addr_type: u8) -> [u8; 15] {
    let [lo, hi] = interval_units.to_le_bytes();
    [
        lo,
        hi,
        lo,
        hi,
        ADV_TYPE_IND,
        own_addr_type,
        0x00,
        0,
        0,
        0,
        0,
        0,
        0,
        ADV_CHANNEL_ALL,
        0x00,
    ]
}

/// LE Set Advertising Data: length byte plus the payload zero-padded to 31
pub fn adv_data_params(data: &AdvertisingData) -> [u8; MAX_ADV_DATA_LEN + 1] {
    let mut params = [0u8; MAX_ADV_DATA_LEN + 1];
    let bytes = data.as_bytes();
    params[0] = bytes.len() as u8;
    params[1..=bytes.len()].copy_from_slice(bytes);
    params
}

// ----------------------------------------------------------------------------
// Packet Parsing
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HciError {
    #[error("Empty HCI packet")]
    Empty,

    #[error("Truncated HCI packet: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciEvent {
    CommandComplete {
        opcode: u16,
        status: u8,
        params: Vec<u8>,
    },
    CommandStatus {
        opcode: u16,
        status: u8,
    },
    Unknown {
        code: u8,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
    Event(HciEvent),
    /// Packet type the control path does not decode
    Other(u8),
}

fn need(buf: &[u8], expected: usize) -> Result<(), HciError> {
    if buf.len() < expected {
        Err(HciError::Truncated {
            expected,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn u16_at(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

/// Parse one H4 packet
pub fn parse_packet(buf: &[u8]) -> Result<HciPacket, HciError> {
    let (&kind, body) = buf.split_first().ok_or(HciError::Empty)?;
    match kind {
        HCI_EVENT_PKT => parse_event(body).map(HciPacket::Event),
        other => Ok(HciPacket::Other(other)),
    }
}

fn parse_event(body: &[u8]) -> Result<HciEvent, HciError> {
    need(body, 2)?;
    let code = body[0];
    let len = body[1] as usize;
    need(body, 2 + len)?;
    let p = &body[2..2 + len];

    let event = match code {
        HCI_EV_CMD_COMPLETE => {
            need(p, 4)?;
            HciEvent::CommandComplete {
                opcode: u16_at(p, 1),
                status: p[3],
                params: p[4..].to_vec(),
            }
        }
        HCI_EV_CMD_STATUS => {
            need(p, 4)?;
            HciEvent::CommandStatus {
                status: p[0],
                opcode: u16_at(p, 2),
            }
        }
        _ => HciEvent::Unknown { code },
    };
    Ok(event)
}

/// Map a non-zero HCI status byte to a backend failure
pub fn status_error(status: u8) -> BleError {
    BleError::backend(-i32::from(status))
}

// ----------------------------------------------------------------------------
// Transport Seam
// ----------------------------------------------------------------------------

/// Bidirectional H4 packet transport
///
/// `recv` blocks for at most the transport's read timeout and reports an
/// expired wait as `WouldBlock` or `TimedOut`.
pub trait HciTransport: Send + Sync + 'static {
    fn send(&self, packet: &[u8]) -> io::Result<()>;
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens a transport to a controller
pub trait HciOpener: Send + Sync + 'static {
    type Transport: HciTransport;

    fn open(&self) -> io::Result<Self::Transport>;
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Send a command and wait for its Command Complete or Command Status.
/// Returns the return parameters following the status byte.
pub fn blocking_command<T: HciTransport + ?Sized>(
    transport: &T,
    opcode: u16,
    params: &[u8],
    timeout: Duration,
) -> BleResult<Vec<u8>> {
    trace!("HCI command 0x{:04X}: {}", opcode, hex::encode(params));
    transport.send(&command_packet(opcode, params))?;

    let deadline = Instant::now() + timeout;
    let mut buf = [0u8; MAX_PACKET_LEN];
    while Instant::now() < deadline {
        let len = match transport.recv(&mut buf) {
            Ok(len) => len,
            Err(err) if is_timeout(&err) => continue,
            Err(err) => return Err(err.into()),
        };
        match parse_packet(&buf[..len]) {
            Ok(HciPacket::Event(HciEvent::CommandComplete {
                opcode: op,
                status,
                params,
            })) if op == opcode => {
                if status != 0 {
                    debug!("HCI command 0x{:04X} failed: status 0x{:02X}", opcode, status);
                    return Err(status_error(status));
                }
                return Ok(params);
            }
            Ok(HciPacket::Event(HciEvent::CommandStatus { opcode: op, status }))
                if op == opcode =>
            {
                if status != 0 {
                    return Err(status_error(status));
                }
                return Ok(Vec::new());
            }
            Ok(other) => trace!("Skipping HCI packet while waiting: {:?}", other),
            Err(err) => debug!("Malformed HCI packet: {}", err),
        }
    }
    Err(BleError::Timeout { opcode })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DeviceName;
    use std::sync::Mutex;

    #[test]
    fn test_command_packet_layout() {
        assert_eq!(
            command_packet(HCI_OP_LE_SET_ADV_ENABLE, &[0x01]),
            vec![0x01, 0x0A, 0x20, 0x01, 0x01]
        );
        assert_eq!(command_packet(0x0C03, &[]), vec![0x01, 0x03, 0x0C, 0x00]);
    }

    #[test]
    fn test_adv_params_for_100ms() {
        assert_eq!(
            adv_params(0x00A0, OWN_ADDR_PUBLIC),
            [0xA0, 0x00, 0xA0, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0x07, 0x00]
        );
    }

    #[test]
    fn test_adv_data_params_are_padded() {
        let data = AdvertisingData::for_device(&DeviceName::default());
        let params = adv_data_params(&data);
        assert_eq!(params[0] as usize, data.len());
        assert_eq!(&params[1..=data.len()], data.as_bytes());
        assert!(params[data.len() + 1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_parse_events() {
        let complete = [0x04, 0x0E, 0x04, 0x01, 0x08, 0x20, 0x00];
        assert_eq!(
            parse_packet(&complete).unwrap(),
            HciPacket::Event(HciEvent::CommandComplete {
                opcode: HCI_OP_LE_SET_ADV_DATA,
                status: 0,
                params: vec![]
            })
        );

        let status = [0x04, 0x0F, 0x04, 0x0C, 0x01, 0x0A, 0x20];
        assert_eq!(
            parse_packet(&status).unwrap(),
            HciPacket::Event(HciEvent::CommandStatus {
                opcode: HCI_OP_LE_SET_ADV_ENABLE,
                status: 0x0C
            })
        );

        let disconn = [0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13];
        assert_eq!(
            parse_packet(&disconn).unwrap(),
            HciPacket::Event(HciEvent::Unknown { code: 0x05 })
        );

        assert_eq!(
            parse_packet(&[0x04, 0x0E, 0x04, 0x01]),
            Err(HciError::Truncated {
                expected: 6,
                actual: 3
            })
        );
        assert_eq!(parse_packet(&[]), Err(HciError::Empty));
    }

    #[test]
    fn test_acl_frames_are_not_decoded() {
        // Start fragment whose L2CAP length exceeds the fragment
        let fragment = [0x02, 0x40, 0x20, 0x1B, 0x00, 0x1E, 0x00, 0x04, 0x00, 0x12];
        assert_eq!(parse_packet(&fragment), Ok(HciPacket::Other(0x02)));
    }

    /// Transport replaying a fixed sequence of controller packets
    struct Replay {
        sent: Mutex<Vec<Vec<u8>>>,
        replies: Mutex<Vec<Vec<u8>>>,
    }

    impl Replay {
        fn new(mut replies: Vec<Vec<u8>>) -> Self {
            replies.reverse();
            Self {
                sent: Mutex::new(Vec::new()),
                replies: Mutex::new(replies),
            }
        }
    }

    impl HciTransport for Replay {
        fn send(&self, packet: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push(packet.to_vec());
            Ok(())
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.lock().unwrap().pop() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn test_blocking_command_skips_unrelated_packets() {
        let transport = Replay::new(vec![
            vec![0x02, 0x40, 0x20, 0x05, 0x00, 0x01, 0x00, 0x04, 0x00, 0x0A],
            vec![0x04, 0x05, 0x04, 0x00, 0x40, 0x00, 0x13],
            vec![0x04, 0x0E, 0x04, 0x01, 0x0A, 0x20, 0x00],
        ]);
        let params = blocking_command(
            &transport,
            HCI_OP_LE_SET_ADV_ENABLE,
            &[0x01],
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(params.is_empty());
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_blocking_command_reports_status_and_timeout() {
        let transport = Replay::new(vec![vec![0x04, 0x0E, 0x04, 0x01, 0x06, 0x20, 0x12]]);
        assert_eq!(
            blocking_command(&transport, HCI_OP_LE_SET_ADV_PARAM, &[], Duration::from_millis(200)),
            Err(BleError::backend(-0x12))
        );

        let silent = Replay::new(Vec::new());
        assert_eq!(
            blocking_command(&silent, HCI_OP_LE_SET_ADV_DATA, &[], Duration::from_millis(20)),
            Err(BleError::Timeout {
                opcode: HCI_OP_LE_SET_ADV_DATA
            })
        );
    }
}
