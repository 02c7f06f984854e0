//! A thin wrapper around a `SOCK_RAW`/`IPPROTO_TCP` socket with
//! `IP_HDRINCL` set, so every byte of the IP header this crate builds in
//! `tcpmany-packet` is sent exactly as constructed rather than rewritten
//! by the kernel.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use tcpmany_packet::Packet;

pub struct RawSocket {
    fd: RawFd,
}

impl RawSocket {
    pub fn open() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_TCP) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let flag: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                &flag as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(Self { fd })
    }

    pub fn send_to(&self, packet: &Packet) -> io::Result<usize> {
        let addr = packet.dst_address();
        let mut sockaddr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sockaddr.sin_family = libc::AF_INET as libc::sa_family_t;
        sockaddr.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());

        let bytes = packet.as_bytes();
        let ret = unsafe {
            libc::sendto(
                self.fd,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
                0,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }

    /// Reads at most `max_len` bytes into `packet`'s buffer, letting
    /// [`crate::EngineConfig::recv_buffer_len`] cap reads below the
    /// buffer's full capacity without shrinking the allocation itself.
    pub fn recv_from(&self, packet: &mut Packet, max_len: usize) -> io::Result<usize> {
        let buf = packet.raw_mut();
        let len = buf.len().min(max_len);
        let ret = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                len,
                0,
                std::ptr::null_mut::<libc::sockaddr>(),
                std::ptr::null_mut::<libc::socklen_t>(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret as usize)
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
