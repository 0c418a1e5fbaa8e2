/* Serial transport: a raw termios port with nonblocking reads and
 * readiness-based timeouts. */

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::Duration;

use nix::fcntl::{self, OFlag};
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, SetArg, SpecialCharacterIndices,
};
use tokio::io::unix::AsyncFd;
use tokio::time::{Instant, timeout};
use tracing::debug;

use super::{FlowControl, SerialConfig, SerialParity};

pub struct SerialPort {
    fd: AsyncFd<OwnedFd>,
}

fn nix_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

fn baud_rate(baud: u32) -> io::Result<BaudRate> {
    match baud {
        2400 => Ok(BaudRate::B2400),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported baud rate: {other}"),
        )),
    }
}

impl SerialPort {
    pub fn open(path: &Path) -> io::Result<Self> {
        let fd = fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(nix_io)?;

        /* SAFETY: `fd` was just returned by `fcntl::open` above and is not
         * owned anywhere else yet. */
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        /* Raw eight-bit mode; the line speed is set by configure(). */
        let mut attrs = termios::tcgetattr(&fd).map_err(nix_io)?;
        termios::cfmakeraw(&mut attrs);
        attrs.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        attrs.control_flags &= !ControlFlags::CRTSCTS;
        attrs.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        attrs.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(&fd, SetArg::TCSANOW, &attrs).map_err(nix_io)?;
        termios::tcflush(&fd, FlushArg::TCIOFLUSH).map_err(nix_io)?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    pub fn configure(&mut self, config: &SerialConfig) -> io::Result<()> {
        let fd = self.fd.get_ref();
        let mut attrs = termios::tcgetattr(fd).map_err(nix_io)?;

        termios::cfsetspeed(&mut attrs, baud_rate(config.baud)?).map_err(nix_io)?;

        attrs.control_flags &= !(ControlFlags::PARENB | ControlFlags::PARODD);
        match config.parity {
            SerialParity::None => {}
            SerialParity::Odd => {
                attrs.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD;
            }
            SerialParity::Even => {
                attrs.control_flags |= ControlFlags::PARENB;
            }
        }
        attrs.control_flags &= !(ControlFlags::CSIZE | ControlFlags::CSTOPB);
        attrs.control_flags |= ControlFlags::CS8;

        termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(nix_io)?;
        debug!("serial configured: {} baud, {:?} parity", config.baud, config.parity);
        Ok(())
    }

    pub fn set_flow_control(&mut self, flow: FlowControl) -> io::Result<()> {
        let fd = self.fd.get_ref();
        let mut attrs = termios::tcgetattr(fd).map_err(nix_io)?;
        match flow {
            FlowControl::None => attrs.control_flags &= !ControlFlags::CRTSCTS,
            FlowControl::Hardware => attrs.control_flags |= ControlFlags::CRTSCTS,
        }
        termios::tcsetattr(fd, SetArg::TCSANOW, &attrs).map_err(nix_io)
    }

    /* Nonblocking read directly on the descriptor. */
    fn raw_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.fd.get_ref().as_raw_fd();
        /* SAFETY: `fd` is a valid open descriptor for the lifetime of
         * this call and `buf` is a live mutable slice of this length. */
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        if res == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "serial hangup"));
        }
        Ok(res as usize)
    }

    /* True iff a byte is immediately readable, without consuming it. */
    fn poll_readable(&self) -> io::Result<bool> {
        let borrowed = self.fd.get_ref().as_fd();
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let n = poll(&mut fds, PollTimeout::ZERO).map_err(nix_io)?;
        Ok(n > 0)
    }

    pub async fn wait_readable(&mut self, limit: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + limit;
        loop {
            if self.poll_readable()? {
                return Ok(true);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match timeout(remaining, self.fd.readable()).await {
                Err(_elapsed) => return Ok(false),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(mut guard)) => guard.clear_ready(),
            }
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
        let mut written = 0;
        while written < data.len() {
            let fd = self.fd.get_ref().as_raw_fd();
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

    pub fn discard_input(&mut self) -> io::Result<()> {
        termios::tcflush(self.fd.get_ref(), FlushArg::TCIFLUSH).map_err(nix_io)
    }

    pub fn drain_output(&mut self) -> io::Result<()> {
        termios::tcdrain(self.fd.get_ref()).map_err(nix_io)
    }

    fn modem_bits(&self) -> io::Result<libc::c_int> {
        let fd = self.fd.get_ref().as_raw_fd();
        let mut bits: libc::c_int = 0;
        /* SAFETY: TIOCMGET writes one c_int through the pointer. */
        let res = unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut bits) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(bits)
    }

    fn change_modem_bit(&mut self, bit: libc::c_int, up: bool) -> io::Result<()> {
        let fd = self.fd.get_ref().as_raw_fd();
        let request = if up { libc::TIOCMBIS } else { libc::TIOCMBIC };
        /* SAFETY: TIOCMBIS/TIOCMBIC read one c_int through the pointer. */
        let res = unsafe { libc::ioctl(fd, request, &bit) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_dtr(&mut self, up: bool) -> io::Result<()> {
        self.change_modem_bit(libc::TIOCM_DTR, up)
    }

    pub fn set_rts(&mut self, up: bool) -> io::Result<()> {
        self.change_modem_bit(libc::TIOCM_RTS, up)
    }

    pub fn test_cts(&mut self) -> io::Result<bool> {
        Ok(self.modem_bits()? & libc::TIOCM_CTS != 0)
    }

    pub fn test_dsr(&mut self) -> io::Result<bool> {
        Ok(self.modem_bits()? & libc::TIOCM_DSR != 0)
    }
}
