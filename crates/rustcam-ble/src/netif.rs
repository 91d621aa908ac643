//! Bring a named network or radio interface administratively up

use std::io;

use tracing::debug;

/// Bring `name` up. `hciN` names go through the Bluetooth control socket,
/// anything else through the generic interface flags.
pub fn interface_up(name: &str) -> io::Result<()> {
    if name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty interface name",
        ));
    }
    if let Some(dev_id) = hci_index(name) {
        debug!("Bringing up Bluetooth controller {}", name);
        return imp::hci_up(dev_id);
    }
    debug!("Bringing up network interface {}", name);
    imp::netdev_up(name)
}

/// Controller index of an `hciN` name
pub fn hci_index(name: &str) -> Option<u16> {
    name.strip_prefix("hci")?.parse().ok()
}

#[cfg(target_os = "linux")]
mod imp {
    use std::io;
    use std::os::unix::io::AsRawFd;

    use socket2::{Domain, Socket, Type};

    #[repr(C)]
    struct IfReqFlags {
        name: [libc::c_char; libc::IFNAMSIZ],
        flags: libc::c_short,
        _pad: [u8; 22],
    }

    pub fn hci_up(dev_id: u16) -> io::Result<()> {
        crate::backend::linux::hci_device_up(dev_id)
    }

    pub fn netdev_up(name: &str) -> io::Result<()> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("interface name too long: {}", name),
            ));
        }
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        let mut req = IfReqFlags {
            name: [0; libc::IFNAMSIZ],
            flags: 0,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }

        // SAFETY: valid fd and an ifreq-sized buffer for the flag ioctls
        let ret = unsafe {
            libc::ioctl(
                socket.as_raw_fd(),
                libc::SIOCGIFFLAGS as _,
                &mut req as *mut IfReqFlags,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let up = libc::IFF_UP as libc::c_short;
        if req.flags & up != 0 {
            return Ok(());
        }
        req.flags |= up;
        // SAFETY: as above
        let ret = unsafe {
            libc::ioctl(
                socket.as_raw_fd(),
                libc::SIOCSIFFLAGS as _,
                &mut req as *mut IfReqFlags,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::io;

    pub fn hci_up(_dev_id: u16) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "interface control not supported on this platform",
        ))
    }

    pub fn netdev_up(_name: &str) -> io::Result<()> {
        hci_up(0)
    }
}
