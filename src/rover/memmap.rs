// Register snapshot of one controller
//
// The snapshot holds ASCII hex exactly as read from the wire, two characters
// per register address. Bytes never written by a successful read keep the
// sentinel, so truncated reads are visible.

use super::codec::{self, RegisterWidth};

pub const MAP_SIZE: usize = 512;

/// Bytes covered by a complete full-map read (three 64-register chunks)
pub const FULL_MAP_LEN: usize = 384;

pub const SENTINEL: u8 = b'X';

#[derive(Clone, PartialEq, Eq)]
pub struct RegisterMap {
    bytes: [u8; MAP_SIZE],
}

impl RegisterMap {
    pub fn new() -> Self {
        Self {
            bytes: [SENTINEL; MAP_SIZE],
        }
    }

    /// Build a map from pre-populated snapshot bytes (e.g. a recorded dump)
    pub fn from_bytes(snapshot: &[u8]) -> Self {
        let mut map = Self::new();
        let len = snapshot.len().min(MAP_SIZE);
        map.bytes[..len].copy_from_slice(&snapshot[..len]);
        map
    }

    /// Store hex text read for the register at `address`
    pub fn store(&mut self, address: u8, text: &[u8]) -> codec::Result<()> {
        let start = address as usize * 2;
        let slot = self
            .bytes
            .get_mut(start..start + text.len())
            .ok_or(codec::CodecError::OutOfBounds {
                address,
                width: text.len() / 2,
            })?;
        slot.copy_from_slice(text);
        Ok(())
    }

    /// Length of the meaningful prefix (bytes before the first sentinel)
    pub fn valid_len(&self) -> usize {
        self.bytes
            .iter()
            .position(|&b| b == SENTINEL)
            .unwrap_or(MAP_SIZE)
    }

    /// Take over the first `len` bytes of another map
    pub fn commit_prefix(&mut self, other: &RegisterMap, len: usize) {
        let len = len.min(MAP_SIZE);
        self.bytes[..len].copy_from_slice(&other.bytes[..len]);
    }

    pub fn register(&self, address: u8, width: RegisterWidth) -> codec::Result<u32> {
        codec::decode_register(&self.bytes, address, width)
    }

    pub fn register_i16(&self, address: u8) -> codec::Result<i16> {
        self.register(address, RegisterWidth::Word)
            .map(codec::to_signed16)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegisterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterMap")
            .field("valid_len", &self.valid_len())
            .finish()
    }
}
