/* TCP transport: a tunnel to a display served over the network. Only the
 * EuroBraille driver advertises this. */

use std::io;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tracing::debug;

pub struct NetChannel {
    stream: TcpStream,
}

impl NetChannel {
    pub async fn connect(host: &str, port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        debug!("tcp tunnel connected: {host}:{port}");
        Ok(Self { stream })
    }

    pub async fn wait_readable(&mut self, limit: Duration) -> io::Result<bool> {
        match timeout(limit, self.stream.readable()).await {
            Err(_elapsed) => Ok(false),
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) => Ok(true),
        }
    }

    pub async fn read_chunk(&mut self, buf: &mut [u8], limit: Duration) -> io::Result<usize> {
        let deadline = Instant::now() + limit;
        loop {
            match self.stream.try_read(buf) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "tcp peer closed",
                    ));
                }
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(0);
            }
            match timeout(remaining, self.stream.readable()).await {
                Err(_elapsed) => return Ok(0),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {}
            }
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write_all(data).await?;
        debug!("TX {} bytes: {:02x?}", data.len(), data);
        Ok(data.len())
    }

    pub async fn discard_input(&mut self) -> io::Result<()> {
        let mut sink = [0u8; 64];
        loop {
            match self.stream.try_read(&mut sink) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "tcp peer closed",
                    ));
                }
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}
