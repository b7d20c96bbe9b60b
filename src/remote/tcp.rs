// TCP remote control session
//
// greeting -> password line (10 s) -> ready banner -> command lines.
// One client per run; the listener closes once a peer has authenticated.

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use super::{RemoteError, RemoteEvent, Reply, parse_command};
use crate::config::{AUTH_TIMEOUT, REMOTE_LINE_BUFFER};

pub const GREETING: &str = "I'm NLAB-MecanumCommander. Please authenticate yourself.\r\n";
pub const AUTH_TIMEOUT_MESSAGE: &str = "Timeout. Goodbye!\r\n";
pub const GOODBYE: &str = "Closing. Byebye!\r\n";

/// Ready banner naming the rover type and firmware
pub fn banner(system_name: u16, firmware: u16) -> String {
    format!(
        "NLAB-MecanumCommander v{} - Rover type: 0x{:02x} firmware: 0x{:02x}. Ready.\r\n",
        env!("CARGO_PKG_VERSION"),
        system_name,
        firmware
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("No line terminator within {limit} bytes")]
    LineTooLong { limit: usize },
}

/// The password must match exactly, optionally followed by LF or CRLF
pub fn authenticate(received: &[u8], password: &str) -> bool {
    let line = received
        .strip_suffix(b"\r\n")
        .or_else(|| received.strip_suffix(b"\n"))
        .unwrap_or(received);
    line == password.as_bytes()
}

/// Split off the first line. A CRLF pair is one terminator.
///
/// Returns the line and the unconsumed rest, or None if no terminator has arrived yet.
pub fn next_token(buffer: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let end = buffer.iter().position(|&b| b == b'\r' || b == b'\n')?;
    let rest = &buffer[end..];
    let rest = rest
        .strip_prefix(b"\r\n")
        .unwrap_or(&rest[1..]);
    Some((buffer[..end].to_vec(), rest))
}

/// Buffers partial lines across reads
pub struct LineBuffer {
    pending: Vec<u8>,
    limit: usize,
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Next non-empty line, if a complete one is buffered
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, ProtocolViolation> {
        while let Some((line, rest)) = next_token(&self.pending) {
            let consumed = self.pending.len() - rest.len();
            self.pending.drain(..consumed);
            if !line.is_empty() {
                return Ok(Some(line));
            }
        }
        if self.pending.len() >= self.limit {
            return Err(ProtocolViolation::LineTooLong { limit: self.limit });
        }
        Ok(None)
    }
}

pub struct TcpSession {
    stream: TcpStream,
    peer: SocketAddr,
    lines: LineBuffer,
}

impl TcpSession {
    /// Wait for one client on `port` and authenticate it
    pub async fn accept(port: u16, password: &str, banner: &str) -> Result<Self, RemoteError> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Waiting for connection on tcp/{}...", port);
        let (stream, peer) = listener.accept().await?;
        info!("Remote peer connected: {}", peer);
        Self::handshake(stream, peer, password, banner).await
    }

    pub async fn handshake(
        mut stream: TcpStream,
        peer: SocketAddr,
        password: &str,
        banner: &str,
    ) -> Result<Self, RemoteError> {
        stream.write_all(GREETING.as_bytes()).await?;

        let mut buffer = [0u8; REMOTE_LINE_BUFFER];
        let received = match tokio::time::timeout(AUTH_TIMEOUT, stream.read(&mut buffer)).await {
            Ok(read) => read?,
            Err(_) => {
                warn!("{} did not authenticate within {:?}", peer, AUTH_TIMEOUT);
                stream.write_all(AUTH_TIMEOUT_MESSAGE.as_bytes()).await?;
                stream.shutdown().await?;
                return Err(RemoteError::AuthTimeout);
            }
        };

        if !authenticate(&buffer[..received], password) {
            warn!("{} sent a bad password", peer);
            stream.write_all(Reply::BadPassword.to_wire().as_bytes()).await?;
            stream.shutdown().await?;
            return Err(RemoteError::BadPassword);
        }

        info!("{} authenticated", peer);
        stream.write_all(banner.as_bytes()).await?;
        Ok(Self {
            stream,
            peer,
            lines: LineBuffer::new(REMOTE_LINE_BUFFER),
        })
    }

    /// Next command line. Cancel-safe: partial lines stay buffered.
    pub async fn recv(&mut self) -> Result<RemoteEvent, RemoteError> {
        let mut buffer = [0u8; REMOTE_LINE_BUFFER];
        loop {
            if let Some(event) = self.try_recv()? {
                return Ok(event);
            }

            let read = self.stream.read(&mut buffer).await?;
            if read == 0 {
                info!("Remote peer {} closed the connection", self.peer);
                return Ok(RemoteEvent::Disconnected);
            }
            self.lines.push(&buffer[..read]);
        }
    }

    /// A complete line that already arrived, without waiting on the socket
    pub fn try_recv(&mut self) -> Result<Option<RemoteEvent>, RemoteError> {
        let event = self.lines.next_line()?.map(|line| match parse_command(&line) {
            Ok(command) => RemoteEvent::Command(command),
            Err(e) => RemoteEvent::Rejected(e),
        });
        Ok(event)
    }

    pub async fn reply(&mut self, reply: Reply) -> std::io::Result<()> {
        self.stream.write_all(reply.to_wire().as_bytes()).await
    }

    pub async fn goodbye(mut self) -> std::io::Result<()> {
        self.stream.write_all(GOODBYE.as_bytes()).await?;
        self.stream.shutdown().await
    }

    #[cfg(test)]
    pub(crate) async fn shutdown_write(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
