// Register-level access to the controllers over a Transport

use tracing::{debug, warn};

use super::codec::CodecError;
use super::commands::{Command, RegisterValue};
use super::link::{Transport, TransportError, sanitize_reply};
use super::memmap::RegisterMap;
use crate::messages::CommErrorCounters;

/// Registers per bulk chunk and the chunk offsets covering a full map
pub const CHUNK_REGISTERS: u8 = 0x40;
pub const CHUNK_OFFSETS: [u8; 3] = [0x00, 0x40, 0x80];

/// Attempts per chunk before a full-map read gives up
pub const CHUNK_ATTEMPTS: usize = 3;

const REPLY_TERMINATOR: &[u8] = b"\r\n";

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("Empty reply from controller 0x{controller:02X} register 0x{register:02X}")]
    EmptyReply { controller: u8, register: u8 },

    #[error(
        "Reply length mismatch from controller 0x{controller:02X} register 0x{register:02X}: expected {expected} hex chars, got {actual} bytes"
    )]
    LengthMismatch {
        controller: u8,
        register: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid read length: {0}")]
    InvalidLength(u8),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ReadError {
    /// Soft failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReadError::EmptyReply { .. } | ReadError::LengthMismatch { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Controller 0x{controller:02X} rejected write: {reply}")]
    Rejected { controller: u8, reply: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl WriteError {
    /// Device or encoding failure, as opposed to a controller that answered badly
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WriteError::Rejected { .. })
    }
}

/// Register bus - encodes commands, runs exchanges and counts bus notices
pub struct RegisterBus<T: Transport> {
    transport: T,
    counters: CommErrorCounters,
}

impl<T: Transport> RegisterBus<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            counters: CommErrorCounters::default(),
        }
    }

    pub fn counters(&self) -> CommErrorCounters {
        self.counters
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn exchange<E>(&mut self, command: &Command) -> Result<Vec<u8>, E>
    where
        E: From<TransportError> + From<CodecError>,
    {
        let bytes = command.encode()?;
        Ok(self.transport.send_command(&bytes)?)
    }

    /// Read `length` bytes at `register` into the snapshot
    pub fn read_register(
        &mut self,
        controller: u8,
        register: u8,
        length: u8,
        map: &mut RegisterMap,
    ) -> Result<(), ReadError> {
        if !matches!(length, 1 | 2 | 4 | CHUNK_REGISTERS) {
            return Err(ReadError::InvalidLength(length));
        }

        let raw = self.exchange::<ReadError>(&Command::Read {
            controller,
            register,
            length,
        })?;
        let payload = sanitize_reply(&raw, &mut self.counters)?;
        if payload.is_empty() {
            return Err(ReadError::EmptyReply {
                controller,
                register,
            });
        }

        // Exactly 2*length hex characters then CRLF, nothing else
        let expected = length as usize * 2;
        let hex = &payload[..payload.len().min(expected)];
        let well_formed = payload.len() == expected + REPLY_TERMINATOR.len()
            && payload.ends_with(REPLY_TERMINATOR)
            && !hex.iter().any(|b| matches!(b, b'\r' | b'\n'));
        if !well_formed {
            return Err(ReadError::LengthMismatch {
                controller,
                register,
                expected,
                actual: payload.len(),
            });
        }

        map.store(register, hex)?;
        Ok(())
    }

    /// Read the whole register space of a controller in chunks.
    ///
    /// Returns the length of the valid prefix; only that prefix is copied into `map`.
    /// A chunk that keeps failing softly ends the read early. Hard failures abort it.
    pub fn read_full_map(&mut self, controller: u8, map: &mut RegisterMap) -> Result<usize, ReadError> {
        let mut scratch = RegisterMap::new();

        'chunks: for offset in CHUNK_OFFSETS {
            let mut attempt = 1;
            loop {
                match self.read_register(controller, offset, CHUNK_REGISTERS, &mut scratch) {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() && attempt < CHUNK_ATTEMPTS => {
                        debug!(
                            "Chunk 0x{:02X} of controller 0x{:02X} failed (attempt {}): {}",
                            offset, controller, attempt, e
                        );
                        attempt += 1;
                    }
                    Err(e) if e.is_retryable() => {
                        warn!(
                            "Giving up on chunk 0x{:02X} of controller 0x{:02X}: {}",
                            offset, controller, e
                        );
                        break 'chunks;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let len = scratch.valid_len();
        map.commit_prefix(&scratch, len);
        Ok(len)
    }

    /// Write a register. Success means the controller answered with no data.
    pub fn write(&mut self, controller: u8, register: u8, value: RegisterValue) -> Result<(), WriteError> {
        debug!(
            "Write controller 0x{:02X} register 0x{:02X} = {:?}",
            controller, register, value
        );
        self.acknowledged(
            controller,
            Command::Write {
                controller,
                register,
                value,
            },
        )
    }

    /// Zero three adjacent 16-bit registers in one command
    pub fn write_zero_triple(&mut self, controller: u8, register: u8) -> Result<(), WriteError> {
        self.acknowledged(
            controller,
            Command::ZeroTriple {
                controller,
                register,
            },
        )
    }

    /// Send a triple-redundant command; its reply carries nothing to check
    pub fn send_triple(&mut self, command: Command) -> Result<(), WriteError> {
        let raw = self.exchange::<WriteError>(&command)?;
        // Still count any bus notices riding on the reply
        if let Err(e) = sanitize_reply(&raw, &mut self.counters) {
            debug!("Ignoring reply to triple command: {}", e);
        }
        Ok(())
    }

    fn acknowledged(&mut self, controller: u8, command: Command) -> Result<(), WriteError> {
        let raw = self.exchange::<WriteError>(&command)?;
        match sanitize_reply(&raw, &mut self.counters) {
            Ok(payload) if payload.is_empty() => Ok(()),
            Ok(payload) => Err(WriteError::Rejected {
                controller,
                reply: String::from_utf8_lossy(&payload).into_owned(),
            }),
            Err(e) => Err(WriteError::Rejected {
                controller,
                reply: e.to_string(),
            }),
        }
    }
}
