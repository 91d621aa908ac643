//! Linux HCI sockets (`AF_BLUETOOTH` / `BTPROTO_HCI`)

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use super::hci::{HciOpener, HciTransport, HCI_EVENT_PKT};

// Bluetooth socket constants (BlueZ extension, not in libc)
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_HCI: i32 = 1;
const SOL_HCI: i32 = 0;
const HCI_FILTER: i32 = 2;

/// Shared with the kernel host; events are filtered per socket
pub const HCI_CHANNEL_RAW: u16 = 0;

// _IOW('H', 201, int)
const HCIDEVUP: u32 = 0x4004_48C9;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

fn hci_socket() -> io::Result<Socket> {
    Socket::new(
        Domain::from(AF_BLUETOOTH),
        Type::RAW,
        Some(Protocol::from(BTPROTO_HCI)),
    )
}

fn bind_hci(socket: &Socket, dev_id: u16, channel: u16) -> io::Result<()> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: channel,
    };
    // SAFETY: valid fd and a correctly sized sockaddr_hci
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const SockaddrHci as *const libc::sockaddr,
            std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn set_hci_filter(socket: &Socket, filter: &HciFilter) -> io::Result<()> {
    // SAFETY: valid fd and a correctly sized hci_filter
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_HCI,
            HCI_FILTER,
            filter as *const HciFilter as *const libc::c_void,
            std::mem::size_of::<HciFilter>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Bring `hciN` up in the kernel. An already running device is not an error.
pub fn hci_device_up(dev_id: u16) -> io::Result<()> {
    let socket = hci_socket()?;
    // SAFETY: HCIDEVUP takes the device index by value
    let ret = unsafe {
        libc::ioctl(
            socket.as_raw_fd(),
            HCIDEVUP as _,
            libc::c_int::from(dev_id),
        )
    };
    if ret >= 0 {
        return Ok(());
    }
    match io::Error::last_os_error() {
        err if err.raw_os_error() == Some(libc::EALREADY) => Ok(()),
        err => Err(err),
    }
}

// ----------------------------------------------------------------------------
// HCI Socket
// ----------------------------------------------------------------------------

/// Raw HCI socket bound to one controller, receiving events only
pub struct HciSocket {
    socket: Socket,
}

impl HciSocket {
    pub fn open(dev_id: u16, read_timeout: Duration) -> io::Result<Self> {
        let socket = hci_socket()?;
        bind_hci(&socket, dev_id, HCI_CHANNEL_RAW)?;
        let filter = HciFilter {
            type_mask: 1 << HCI_EVENT_PKT,
            event_mask: [0xFFFF_FFFF, 0xFFFF_FFFF],
            opcode: 0,
        };
        set_hci_filter(&socket, &filter)?;
        socket.set_read_timeout(Some(read_timeout))?;
        debug!("Opened raw HCI socket on hci{}", dev_id);
        Ok(Self { socket })
    }
}

impl HciTransport for HciSocket {
    fn send(&self, packet: &[u8]) -> io::Result<()> {
        (&self.socket).write_all(packet)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.socket).read(buf)
    }
}

/// Opens [`HciSocket`]s for one controller
#[derive(Debug, Clone)]
pub struct HciSocketOpener {
    pub dev_id: u16,
    pub read_timeout: Duration,
}

impl HciSocketOpener {
    pub fn new(dev_id: u16) -> Self {
        Self {
            dev_id,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl HciOpener for HciSocketOpener {
    type Transport = HciSocket;

    fn open(&self) -> io::Result<HciSocket> {
        HciSocket::open(self.dev_id, self.read_timeout)
    }
}
