//! The tunnel device carrying the clear side of the tunnel.
//!
//! Linux uses a TUN file descriptor (`IFF_TUN | IFF_NO_PI`) that moves
//! raw IP datagrams. macOS uses a utun control socket, which prefixes
//! every datagram with a 4-byte protocol family; the prefix lives in the
//! packet's head room so reads and writes stay single-syscall.

use std::io;
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use log::info;

use crate::packet::{Packet, PACKET_DATA_LEN};

pub const TUN_NAME: &str = "signsky.clr";

pub struct TunDev {
    fd: RawFd,
}

impl Drop for TunDev {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

impl TunDev {
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(io::Error::last_os_error()).context("failed to set O_NONBLOCK");
    }
    Ok(())
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;

    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    #[repr(C)]
    struct IfReq {
        ifr_name: [u8; libc::IFNAMSIZ],
        ifr_flags: libc::c_short,
    }

    pub fn open() -> Result<TunDev> {
        let path = std::ffi::CString::new("/dev/net/tun").unwrap();
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
        if fd == -1 {
            return Err(io::Error::last_os_error()).context("failed to open /dev/net/tun");
        }
        let dev = TunDev { fd };

        let mut req = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short,
        };
        req.ifr_name[..TUN_NAME.len()].copy_from_slice(TUN_NAME.as_bytes());

        if unsafe { libc::ioctl(dev.fd, TUNSETIFF, &req) } == -1 {
            return Err(io::Error::last_os_error())
                .context(format!("ioctl(TUNSETIFF) for {} failed", TUN_NAME));
        }

        set_nonblocking(dev.fd)?;
        info!("tunnel device {} ready", TUN_NAME);
        Ok(dev)
    }

    pub fn read_packet(dev: &TunDev, pkt: &mut Packet) -> io::Result<usize> {
        let data = pkt.data_mut();
        let n = unsafe {
            libc::read(
                dev.fd,
                data.as_mut_ptr() as *mut libc::c_void,
                PACKET_DATA_LEN,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        pkt.length = n as usize;
        Ok(n as usize)
    }

    pub fn write_packet(dev: &TunDev, pkt: &mut Packet) -> io::Result<usize> {
        let len = pkt.length;
        let data = pkt.data();
        let n = unsafe { libc::write(dev.fd, data.as_ptr() as *const libc::c_void, len) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::*;
    use crate::packet::PACKET_HEAD_LEN;

    const UTUN_CONTROL: &str = "com.apple.net.utun_control";
    const UTUN_UNIT: u32 = 100;

    /// Datagram prefix on the utun control socket.
    const AF_HEADER_LEN: usize = 4;

    pub fn open() -> Result<TunDev> {
        let fd = unsafe { libc::socket(libc::PF_SYSTEM, libc::SOCK_DGRAM, libc::SYSPROTO_CONTROL) };
        if fd == -1 {
            return Err(io::Error::last_os_error()).context("failed to open utun control socket");
        }
        let dev = TunDev { fd };

        let mut info: libc::ctl_info = unsafe { std::mem::zeroed() };
        info.ctl_name[..UTUN_CONTROL.len()]
            .copy_from_slice(unsafe { &*(UTUN_CONTROL.as_bytes() as *const [u8] as *const [i8]) });
        if unsafe { libc::ioctl(dev.fd, libc::CTLIOCGINFO, &mut info) } == -1 {
            return Err(io::Error::last_os_error()).context("ioctl(CTLIOCGINFO) failed");
        }

        let mut addr: libc::sockaddr_ctl = unsafe { std::mem::zeroed() };
        addr.sc_len = std::mem::size_of::<libc::sockaddr_ctl>() as u8;
        addr.sc_family = libc::AF_SYSTEM as u8;
        addr.ss_sysaddr = libc::AF_SYS_CONTROL as u16;
        addr.sc_id = info.ctl_id;
        addr.sc_unit = UTUN_UNIT;

        if unsafe {
            libc::connect(
                dev.fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ctl>() as libc::socklen_t,
            )
        } == -1
        {
            return Err(io::Error::last_os_error()).context("failed to connect utun control");
        }

        set_nonblocking(dev.fd)?;
        info!("tunnel device utun{} ready", UTUN_UNIT - 1);
        Ok(dev)
    }

    pub fn read_packet(dev: &TunDev, pkt: &mut Packet) -> io::Result<usize> {
        let start = PACKET_HEAD_LEN - AF_HEADER_LEN;
        let buf = &mut pkt.head_mut()[start..];
        let n = unsafe {
            libc::read(
                dev.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                AF_HEADER_LEN + PACKET_DATA_LEN,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = (n as usize).saturating_sub(AF_HEADER_LEN);
        pkt.length = n;
        Ok(n)
    }

    pub fn write_packet(dev: &TunDev, pkt: &mut Packet) -> io::Result<usize> {
        // The AF prefix goes into the tail of the head room, immediately
        // in front of the payload, so one write covers both.
        let len = pkt.length;
        let start = PACKET_HEAD_LEN - AF_HEADER_LEN;
        let buf = pkt.head_mut();
        buf[start..PACKET_HEAD_LEN].copy_from_slice(&(libc::AF_INET as u32).to_be_bytes());
        let n = unsafe {
            libc::write(
                dev.fd,
                buf[start..].as_ptr() as *const libc::c_void,
                AF_HEADER_LEN + len,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((n as usize).saturating_sub(AF_HEADER_LEN))
    }
}

/// Create the tunnel device and return its descriptor.
pub fn open() -> Result<TunDev> {
    platform::open()
}

/// Read one datagram into the packet's payload area, setting its length.
pub fn read_packet(dev: &TunDev, pkt: &mut Packet) -> io::Result<usize> {
    platform::read_packet(dev, pkt)
}

/// Write the packet's payload out as one datagram.
pub fn write_packet(dev: &TunDev, pkt: &mut Packet) -> io::Result<usize> {
    platform::write_packet(dev, pkt)
}
