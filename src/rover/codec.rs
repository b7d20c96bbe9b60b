// Register value codec
//
// Register values travel as ASCII hex, one byte pair per register address,
// in the controller's little-endian byte order: 0x1234 at width 2 is "3412".

use std::fmt::Write as _;

/// Width of a single register access in bytes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterWidth {
    Byte = 1,
    Word = 2,
    Long = 4,
}

impl RegisterWidth {
    pub fn bytes(self) -> usize {
        self as usize
    }

    /// Number of hex characters the value occupies on the wire
    pub fn hex_len(self) -> usize {
        self.bytes() * 2
    }

    fn max_value(self) -> u32 {
        match self {
            RegisterWidth::Byte => u8::MAX as u32,
            RegisterWidth::Word => u16::MAX as u32,
            RegisterWidth::Long => u32::MAX,
        }
    }
}

impl TryFrom<u8> for RegisterWidth {
    type Error = CodecError;

    fn try_from(width: u8) -> Result<Self> {
        match width {
            1 => Ok(RegisterWidth::Byte),
            2 => Ok(RegisterWidth::Word),
            4 => Ok(RegisterWidth::Long),
            other => Err(CodecError::InvalidWidth(other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Invalid register width: {0} bytes")]
    InvalidWidth(u8),

    #[error("Register 0x{address:02X} does not hold valid hex")]
    MalformedHex { address: u8 },

    #[error("Register 0x{address:02X} ({width} bytes) is outside the buffer")]
    OutOfBounds { address: u8, width: usize },

    #[error("Value 0x{value:X} does not fit in {width} bytes")]
    ValueTooWide { value: u32, width: usize },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Hex text for a value at the given width, low byte first
pub fn encode_value(width: RegisterWidth, value: u32) -> Result<String> {
    if value > width.max_value() {
        return Err(CodecError::ValueTooWide {
            value,
            width: width.bytes(),
        });
    }
    let mut text = String::with_capacity(width.hex_len());
    for byte in &value.to_le_bytes()[..width.bytes()] {
        // Writing into a String cannot fail
        let _ = write!(text, "{:02X}", byte);
    }
    Ok(text)
}

/// Register address and value fields of a write command: "AA VVVV"
pub fn encode_register(address: u8, width: RegisterWidth, value: u32) -> Result<String> {
    Ok(format!("{:02X} {}", address, encode_value(width, value)?))
}

/// Two's-complement bit pattern of a signed 16-bit value
pub fn encode_i16(value: i16) -> u32 {
    value as u16 as u32
}

/// Read a register out of a snapshot buffer
pub fn decode_register(buffer: &[u8], address: u8, width: RegisterWidth) -> Result<u32> {
    let start = address as usize * 2;
    let text = buffer
        .get(start..start + width.hex_len())
        .ok_or(CodecError::OutOfBounds {
            address,
            width: width.bytes(),
        })?;

    let mut value = 0u32;
    for (index, pair) in text.chunks_exact(2).enumerate() {
        let byte = parse_hex_byte(pair).ok_or(CodecError::MalformedHex { address })?;
        value |= (byte as u32) << (8 * index);
    }
    Ok(value)
}

/// Reinterpret the low 16 bits as a signed value
pub fn to_signed16(raw: u32) -> i16 {
    raw as u16 as i16
}

fn parse_hex_byte(pair: &[u8]) -> Option<u8> {
    let high = (pair[0] as char).to_digit(16)?;
    let low = (pair[1] as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(address: u8, text: &str) -> Vec<u8> {
        let mut buffer = vec![b'X'; 512];
        let start = address as usize * 2;
        buffer[start..start + text.len()].copy_from_slice(text.as_bytes());
        buffer
    }

    #[test]
    fn test_encode_is_low_byte_first() {
        assert_eq!(encode_value(RegisterWidth::Word, 0x1234).unwrap(), "3412");
        assert_eq!(encode_value(RegisterWidth::Byte, 0x03).unwrap(), "03");
        assert_eq!(
            encode_value(RegisterWidth::Long, 0x1234_5678).unwrap(),
            "78563412"
        );
        assert_eq!(
            encode_register(0xC0, RegisterWidth::Word, 0x0064).unwrap(),
            "C0 6400"
        );
    }

    #[test]
    fn test_round_trip_through_snapshot() {
        let cases = [
            (RegisterWidth::Byte, [0u32, 1, 0x7F, 0xFF].as_slice()),
            (RegisterWidth::Word, [0, 0x00FF, 0x1234, 0x8000, 0xFFFF].as_slice()),
            (RegisterWidth::Long, [0, 0xDEAD_BEEF, u32::MAX].as_slice()),
        ];
        for (width, values) in cases {
            for &value in values {
                let text = encode_value(width, value).unwrap();
                let buffer = snapshot_with(0x42, &text);
                assert_eq!(decode_register(&buffer, 0x42, width).unwrap(), value);
            }
        }
    }

    #[test]
    fn test_signed_unwrap() {
        assert_eq!(to_signed16(32767), 32767);
        assert_eq!(to_signed16(32768), -32768);
        assert_eq!(to_signed16(0xFFFF), -1);
        assert_eq!(to_signed16(encode_i16(-100)), -100);
        assert_eq!(encode_value(RegisterWidth::Word, encode_i16(-1)).unwrap(), "FFFF");
    }

    #[test]
    fn test_invalid_width_rejected() {
        assert_eq!(RegisterWidth::try_from(3), Err(CodecError::InvalidWidth(3)));
        assert_eq!(RegisterWidth::try_from(8), Err(CodecError::InvalidWidth(8)));
        assert_eq!(RegisterWidth::try_from(4), Ok(RegisterWidth::Long));
    }

    #[test]
    fn test_value_too_wide() {
        assert!(matches!(
            encode_value(RegisterWidth::Byte, 0x100),
            Err(CodecError::ValueTooWide { .. })
        ));
    }

    #[test]
    fn test_sentinel_bytes_are_malformed() {
        let buffer = vec![b'X'; 512];
        assert_eq!(
            decode_register(&buffer, 0x00, RegisterWidth::Word),
            Err(CodecError::MalformedHex { address: 0x00 })
        );
    }

    #[test]
    fn test_out_of_bounds() {
        let buffer = vec![b'0'; 512];
        assert!(decode_register(&buffer, 0xFF, RegisterWidth::Byte).is_ok());
        assert!(decode_register(&buffer, 0xFE, RegisterWidth::Word).is_ok());
        assert!(matches!(
            decode_register(&buffer, 0xFF, RegisterWidth::Word),
            Err(CodecError::OutOfBounds { .. })
        ));
    }
}
