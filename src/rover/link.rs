// Serial link to the RS485 motor controllers
//
// One exchange = open the port, flush stale input, write a command line,
// collect the reply byte by byte until the line goes idle, close the port.
// Replies may carry diagnostic notices which are counted and stripped here.

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, trace};

use crate::config::{REPLY_BUFFER_SIZE, REPLY_IDLE_TIMEOUT};
use crate::messages::CommErrorCounters;

/// Controller "ready" notice (sic), emitted spuriously in some link states
const READY_NOTICE: &[u8] = b"readey\r\n";

/// RS485 bus error notices for the two known bus ids
const PRIMARY_BUS_NOTICE: &[u8] = b"485err_T: 10\r\n";
const SECONDARY_BUS_NOTICE: &[u8] = b"485err_T: 1F\r\n";

/// Offset of the first lowercase 'e' inside a bus notice
const NOTICE_ANCHOR_OFFSET: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Reply exceeded {capacity} bytes")]
    Overflow { capacity: usize },

    #[error("Unexpected character 0x{byte:02X} in reply {reply:?}")]
    UnexpectedCharacter { byte: u8, reply: String },

    #[error("Unrecognized diagnostic notice in reply {reply:?}")]
    UnrecognizedNotice { reply: String },
}

impl TransportError {
    /// The exchange completed but the reply could not be trusted
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            TransportError::Overflow { .. }
                | TransportError::UnexpectedCharacter { .. }
                | TransportError::UnrecognizedNotice { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A request/response channel to the controllers
pub trait Transport {
    /// Send one command and return the raw reply (possibly empty)
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).send_command(command)
    }
}

/// Serial transport that holds the device only for the length of one exchange
pub struct SerialTransport {
    path: String,
    baudrate: u32,
    idle_timeout: Duration,
    capacity: usize,
}

impl SerialTransport {
    pub fn new(path: &str, baudrate: u32) -> Self {
        Self {
            path: path.to_string(),
            baudrate,
            idle_timeout: REPLY_IDLE_TIMEOUT,
            capacity: REPLY_BUFFER_SIZE,
        }
    }

    fn open(&self) -> Result<Box<dyn SerialPort>> {
        let port = serialport::new(&self.path, self.baudrate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.idle_timeout)
            .open()?;
        Ok(port)
    }
}

impl Transport for SerialTransport {
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        // The port is dropped (closed) on every return path below
        let mut port = self.open()?;
        port.clear(ClearBuffer::Input)?;

        port.write_all(command)?;
        if !command.ends_with(b"\n") {
            port.write_all(b"\n")?;
        }
        port.flush()?;

        let reply = collect_reply(&mut port, self.idle_timeout, self.capacity)?;
        trace!(
            "{} exchange: {:?} -> {:?}",
            self.path,
            String::from_utf8_lossy(command),
            String::from_utf8_lossy(&reply)
        );
        Ok(reply)
    }
}

/// Source of reply bytes with a per-byte wait
pub trait ByteSource {
    /// Next byte, or None when nothing arrives within `wait`
    fn next_byte(&mut self, wait: Duration) -> Result<Option<u8>>;
}

impl ByteSource for Box<dyn SerialPort> {
    fn next_byte(&mut self, wait: Duration) -> Result<Option<u8>> {
        self.set_timeout(wait)?;
        let mut byte = [0u8; 1];
        match self.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

/// Read until the line goes idle. After a newline only already-queued bytes are taken.
pub fn collect_reply<S: ByteSource + ?Sized>(
    source: &mut S,
    idle: Duration,
    capacity: usize,
) -> Result<Vec<u8>> {
    let mut reply = Vec::new();
    let mut wait = idle;

    while let Some(byte) = source.next_byte(wait)? {
        if reply.len() >= capacity {
            return Err(TransportError::Overflow { capacity });
        }
        reply.push(byte);
        wait = if byte == b'\n' { Duration::ZERO } else { idle };
    }
    Ok(reply)
}

/// Strip known notices from a raw reply, counting bus errors, and validate what remains.
///
/// A reply holding only notices yields an empty payload.
pub fn sanitize_reply(reply: &[u8], counters: &mut CommErrorCounters) -> Result<Vec<u8>> {
    let mut payload = reply.to_vec();

    while let Some(start) = find(&payload, READY_NOTICE) {
        debug!("Stripped ready notice from reply");
        payload.drain(start..start + READY_NOTICE.len());
    }

    // Hex payloads are uppercase, so any lowercase 'e' left belongs to a bus notice
    while let Some(anchor) = payload.iter().position(|&b| b == b'e') {
        let notice = anchor
            .checked_sub(NOTICE_ANCHOR_OFFSET)
            .and_then(|start| {
                let rest = &payload[start..];
                if rest.starts_with(PRIMARY_BUS_NOTICE) {
                    Some((start, true))
                } else if rest.starts_with(SECONDARY_BUS_NOTICE) {
                    Some((start, false))
                } else {
                    None
                }
            });

        let Some((start, primary)) = notice else {
            return Err(TransportError::UnrecognizedNotice {
                reply: String::from_utf8_lossy(reply).into_owned(),
            });
        };

        if primary {
            counters.primary += 1;
        } else {
            counters.secondary += 1;
        }
        debug!(
            "Stripped RS485 error notice ({} bus), counters now {:?}",
            if primary { "primary" } else { "secondary" },
            counters
        );
        payload.drain(start..start + PRIMARY_BUS_NOTICE.len());
    }

    if let Some(&byte) = payload
        .iter()
        .find(|&&b| !matches!(b, b'0'..=b'9' | b'A'..=b'F' | b'\r' | b'\n'))
    {
        return Err(TransportError::UnexpectedCharacter {
            byte,
            reply: String::from_utf8_lossy(reply).into_owned(),
        });
    }

    Ok(payload)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
