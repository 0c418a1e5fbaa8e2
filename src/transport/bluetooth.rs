/* Bluetooth transport: an RFCOMM stream socket, nonblocking with
 * readiness-based timeouts. The displays all listen on channel 1. */

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use nix::libc;
use tokio::io::unix::AsyncFd;
use tokio::time::{Instant, timeout};
use tracing::debug;

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_RFCOMM: libc::c_int = 3;

/* struct sockaddr_rc from <bluetooth/rfcomm.h>; libc does not carry it. */
#[repr(C)]
struct SockaddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

pub struct BluetoothChannel {
    fd: AsyncFd<OwnedFd>,
}

impl BluetoothChannel {
    pub fn open(address: [u8; 6], channel: u8) -> io::Result<Self> {
        /* SAFETY: plain socket(2) call; the result is checked below. */
        let raw = unsafe { libc::socket(AF_BLUETOOTH, libc::SOCK_STREAM, BTPROTO_RFCOMM) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        /* SAFETY: `raw` is a fresh descriptor we own. */
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        /* bdaddr_t is stored least significant byte first. */
        let mut bdaddr = address;
        bdaddr.reverse();
        let sockaddr = SockaddrRc {
            rc_family: AF_BLUETOOTH as libc::sa_family_t,
            rc_bdaddr: bdaddr,
            rc_channel: channel,
        };

        /* SAFETY: `sockaddr` is a live sockaddr_rc and the length passed
         * matches its size. Blocking connect on a blocking socket. */
        let res = unsafe {
            libc::connect(
                raw,
                (&sockaddr as *const SockaddrRc).cast(),
                size_of::<SockaddrRc>() as libc::socklen_t,
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        /* SAFETY: fcntl on a descriptor we own. */
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL);
            if flags < 0 || libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        debug!("rfcomm connected: channel {channel}");
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    fn raw_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = std::os::fd::AsRawFd::as_raw_fd(self.fd.get_ref());
        /* SAFETY: `fd` is a valid open descriptor and `buf` is a live
         * mutable slice of this length. */
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        if res == 0 {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "rfcomm peer closed",
            ));
        }
        Ok(res as usize)
    }

    pub async fn wait_readable(&mut self, limit: Duration) -> io::Result<bool> {
        match timeout(limit, self.fd.readable()).await {
            Err(_elapsed) => Ok(false),
            Ok(Err(e)) => Err(e),
            Ok(Ok(_guard)) => Ok(true),
        }
    }

    pub async fn read_chunk(&mut self, buf: &mut [u8], limit: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + limit;
        loop {
            match self.raw_read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            match timeout(remaining, self.fd.readable()).await {
                Err(_elapsed) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(mut guard)) => guard.clear_ready(),
            }
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let fd = std::os::fd::AsRawFd::as_raw_fd(self.fd.get_ref());
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            /* SAFETY: `fd` is a valid open descriptor and `rest` is a
             * live immutable slice of this length. */
            let res =
                unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
            if res < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    self.fd.writable().await?.clear_ready();
                    continue;
                }
                return Err(e);
            }
            written += res as usize;
        }
        debug!("TX {} bytes: {:02x?}", data.len(), data);
        Ok(written)
    }

    pub async fn discard_input(&mut self) -> io::Result<()> {
        let mut sink = [0u8; 64];
        loop {
            match self.raw_read(&mut sink) {
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
