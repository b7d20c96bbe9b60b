// UDP remote control
//
// Datagram: [seq_hi, seq_lo, cmd[8], crc_hi, crc_lo]
// seq is big-endian; crc is CRC-16/XMODEM over the first 10 bytes.
// No authentication, no replies. Out-of-order and repeated datagrams are dropped.

use crc::{Algorithm, Crc};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{COMMAND_LEN, RemoteError, RemoteEvent, parse_command};

pub const DATAGRAM_LEN: usize = 12;
pub const DATAGRAM_CRC: Algorithm<u16> = crc::CRC_16_XMODEM;

const CHECKED_LEN: usize = 2 + COMMAND_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DatagramError {
    #[error("Datagram of {0} bytes, expected 12")]
    WrongSize(usize),

    #[error("Checksum mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    BadChecksum { expected: u16, actual: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datagram {
    pub sequence: u16,
    pub command: [u8; COMMAND_LEN],
}

fn checksum(bytes: &[u8]) -> u16 {
    Crc::<u16>::new(&DATAGRAM_CRC).checksum(bytes)
}

pub fn encode_datagram(sequence: u16, command: &[u8; COMMAND_LEN]) -> [u8; DATAGRAM_LEN] {
    let mut datagram = [0u8; DATAGRAM_LEN];
    datagram[..2].copy_from_slice(&sequence.to_be_bytes());
    datagram[2..CHECKED_LEN].copy_from_slice(command);
    let crc = checksum(&datagram[..CHECKED_LEN]);
    datagram[CHECKED_LEN..].copy_from_slice(&crc.to_be_bytes());
    datagram
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, DatagramError> {
    if bytes.len() != DATAGRAM_LEN {
        return Err(DatagramError::WrongSize(bytes.len()));
    }
    let expected = checksum(&bytes[..CHECKED_LEN]);
    let actual = u16::from_be_bytes([bytes[CHECKED_LEN], bytes[CHECKED_LEN + 1]]);
    if expected != actual {
        return Err(DatagramError::BadChecksum { expected, actual });
    }

    let mut command = [0u8; COMMAND_LEN];
    command.copy_from_slice(&bytes[2..CHECKED_LEN]);
    Ok(Datagram {
        sequence: u16::from_be_bytes([bytes[0], bytes[1]]),
        command,
    })
}

/// Accepts only strictly increasing sequence numbers
#[derive(Debug, Default)]
pub struct DatagramFilter {
    last_sequence: Option<u16>,
}

impl DatagramFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, sequence: u16) -> bool {
        if self.last_sequence.is_some_and(|last| sequence <= last) {
            return false;
        }
        self.last_sequence = Some(sequence);
        true
    }

    pub fn last_sequence(&self) -> Option<u16> {
        self.last_sequence
    }
}

pub struct UdpSession {
    socket: UdpSocket,
    filter: DatagramFilter,
}

impl UdpSession {
    pub async fn bind(port: u16) -> Result<Self, RemoteError> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        info!("Listening for commands on udp/{}", port);
        Ok(Self::new(socket))
    }

    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            filter: DatagramFilter::new(),
        }
    }

    /// Next valid, in-order command. Invalid datagrams are dropped here.
    pub async fn recv(&mut self) -> Result<RemoteEvent, RemoteError> {
        // one spare byte so oversized datagrams are detected
        let mut buffer = [0u8; DATAGRAM_LEN + 1];
        loop {
            let (len, from) = self.socket.recv_from(&mut buffer).await?;
            if let Some(command) = self.accept(&buffer[..len], from) {
                return Ok(RemoteEvent::Command(command));
            }
        }
    }

    /// Next valid command among datagrams already queued on the socket
    pub fn try_recv(&mut self) -> Result<Option<RemoteEvent>, RemoteError> {
        let mut buffer = [0u8; DATAGRAM_LEN + 1];
        loop {
            match self.socket.try_recv_from(&mut buffer) {
                Ok((len, from)) => {
                    if let Some(command) = self.accept(&buffer[..len], from) {
                        return Ok(Some(RemoteEvent::Command(command)));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn accept(&mut self, bytes: &[u8], from: SocketAddr) -> Option<super::RemoteCommand> {
        let datagram = match decode_datagram(bytes) {
            Ok(datagram) => datagram,
            Err(e) => {
                warn!("Dropped datagram from {}: {}", from, e);
                return None;
            }
        };
        if !self.filter.admit(datagram.sequence) {
            debug!(
                "Dropped datagram {} from {} (last accepted {:?})",
                datagram.sequence,
                from,
                self.filter.last_sequence()
            );
            return None;
        }
        match parse_command(&datagram.command) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(
                    "Dropped datagram {} from {}: {} ({:?})",
                    datagram.sequence,
                    from,
                    e,
                    String::from_utf8_lossy(&datagram.command)
                );
                None
            }
        }
    }
}
