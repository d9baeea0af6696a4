//! Raw packet socket bound to a monitor-mode interface.
//!
//! Capture and injection go through `AF_PACKET`/`SOCK_RAW`; the interface
//! must already be in monitor mode (the daemon does not drive nl80211).

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use super::WlanLink;

pub struct PacketSocket {
    fd: RawFd,
    pub ifindex: u32,
}

impl PacketSocket {
    /// Open and bind a non-blocking packet socket on `interface`.
    pub fn open(interface: &str) -> io::Result<Self> {
        let name = CString::new(interface)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;

        let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
        if ifindex == 0 {
            return Err(io::Error::last_os_error());
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be() as libc::c_int;
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let socket = Self { fd, ifindex };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol as u16;
        addr.sll_ifindex = ifindex as libc::c_int;

        let rc = unsafe {
            libc::bind(
                socket.fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        socket.set_nonblocking()?;
        Ok(socket)
    }

    /// Read the interface's hardware address.
    pub fn hardware_address(interface: &str) -> io::Result<nan_wire::EtherAddr> {
        let name = CString::new(interface)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name"))?;
        if name.as_bytes_with_nul().len() > libc::IFNAMSIZ {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name"));
        }

        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
        for (slot, byte) in request
            .ifr_name
            .iter_mut()
            .zip(name.as_bytes_with_nul().iter())
        {
            *slot = *byte as libc::c_char;
        }

        let rc = unsafe { libc::ioctl(fd, libc::SIOCGIFHWADDR, &mut request) };
        let result = if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            let mut octets = [0u8; 6];
            let data = unsafe { request.ifr_ifru.ifru_hwaddr.sa_data };
            for (slot, byte) in octets.iter_mut().zip(data.iter()) {
                *slot = *byte as u8;
            }
            Ok(nan_wire::EtherAddr(octets))
        };
        unsafe { libc::close(fd) };
        result
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for PacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl WlanLink for PacketSocket {
    fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let rc = unsafe {
            libc::send(self.fd, frame.as_ptr() as *const libc::c_void, frame.len(), 0)
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn receive_frame(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::recv(
                self.fd,
                buffer.as_mut_ptr() as *mut libc::c_void,
                buffer.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }
}

impl Drop for PacketSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
