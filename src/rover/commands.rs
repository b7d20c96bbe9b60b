// Controller command encodings
//
// Text commands:
//   read   r<ctrl> <reg> <len>\n
//   write  w<ctrl> <reg> <value hex, low byte first>\n
// Triple-redundant binary commands (needs firmware with kkk support):
//   speeds kkk + [xh xl yh yl rh rl] x3 + \n\n\n
//   stop   STPSTPSTP\n\n\n

use super::codec::{self, RegisterWidth};
use crate::messages::MotionCommand;

pub const TRIPLE_PREFIX: &[u8; 3] = b"kkk";
pub const TRIPLE_SUFFIX: &[u8; 3] = b"\n\n\n";
pub const TRIPLE_STOP: &[u8] = b"STPSTPSTP\n\n\n";
pub const TRIPLE_FRAME_LEN: usize = 24;

/// Bytes a triple frame must never carry: line end and the command prefixes
pub const RESERVED_BYTES: [u8; 5] = [b'\n', b'r', b'R', b'w', b'W'];

// Controller rotation scaling for kkk frames
const TRIPLE_ROTATION_DIVISOR: i32 = 4;

/// How speed commands are sent for a whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandMode {
    #[default]
    SingleRegister,
    TripleRedundant,
}

/// A typed register value; the variant fixes the wire width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I16(i16),
}

impl RegisterValue {
    pub fn width(self) -> RegisterWidth {
        match self {
            RegisterValue::U8(_) => RegisterWidth::Byte,
            RegisterValue::U16(_) | RegisterValue::I16(_) => RegisterWidth::Word,
            RegisterValue::U32(_) => RegisterWidth::Long,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            RegisterValue::U8(v) => v as u32,
            RegisterValue::U16(v) => v as u32,
            RegisterValue::U32(v) => v,
            RegisterValue::I16(v) => codec::encode_i16(v),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Read `length` bytes starting at `register`
    Read { controller: u8, register: u8, length: u8 },
    Write { controller: u8, register: u8, value: RegisterValue },
    /// Zero three adjacent 16-bit registers
    ZeroTriple { controller: u8, register: u8 },
    TripleMotion(MotionCommand),
    TripleStop,
}

impl Command {
    pub fn encode(&self) -> codec::Result<Vec<u8>> {
        let bytes = match *self {
            Command::Read {
                controller,
                register,
                length,
            } => format!("r{:02X} {:02X} {:02X}\n", controller, register, length).into_bytes(),
            Command::Write {
                controller,
                register,
                value,
            } => format!(
                "w{:02X} {}\n",
                controller,
                codec::encode_register(register, value.width(), value.raw())?
            )
            .into_bytes(),
            Command::ZeroTriple {
                controller,
                register,
            } => format!("w{:02X} {:02X} 000000000000\n", controller, register).into_bytes(),
            Command::TripleMotion(motion) => triple_frame(&motion).to_vec(),
            Command::TripleStop => TRIPLE_STOP.to_vec(),
        };
        Ok(bytes)
    }
}

/// Encode one 16-bit value as two frame bytes.
///
/// Each byte is biased by one so it is never zero (saturating: a high byte
/// from 0x7F up and a low byte of 0xFF are kept), then any reserved byte is
/// moved down by one. Precision is traded for framing safety.
pub fn encode_triple_value(value: i16) -> [u8; 2] {
    let [mut high, mut low] = value.to_be_bytes();
    if high < 0x7F {
        high += 1;
    }
    if low < 0xFF {
        low += 1;
    }
    [avoid_reserved(high), avoid_reserved(low)]
}

fn avoid_reserved(byte: u8) -> u8 {
    if RESERVED_BYTES.contains(&byte) {
        byte - 1
    } else {
        byte
    }
}

/// Build the 24-byte triple-redundant speed frame
pub fn triple_frame(motion: &MotionCommand) -> [u8; TRIPLE_FRAME_LEN] {
    // MotionCommand is clamped, so every axis fits in i16
    let values = [
        motion.speed_x() as i16,
        motion.speed_y() as i16,
        (motion.rotation() / TRIPLE_ROTATION_DIVISOR) as i16,
    ];

    let mut payload = [0u8; 6];
    for (slot, value) in payload.chunks_exact_mut(2).zip(values) {
        slot.copy_from_slice(&encode_triple_value(value));
    }

    let mut frame = [0u8; TRIPLE_FRAME_LEN];
    frame[..3].copy_from_slice(TRIPLE_PREFIX);
    for copy in frame[3..21].chunks_exact_mut(6) {
        copy.copy_from_slice(&payload);
    }
    frame[21..].copy_from_slice(TRIPLE_SUFFIX);
    frame
}
