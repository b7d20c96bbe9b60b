// Rover controller access over the RS485 register protocol
//
// Provides:
// - ASCII-hex register codec and register snapshots
// - Serial transport with reply framing and notice sanitizing
// - Read/write and triple-redundant command encodings
// - Rover variant identification and the high-level session

mod bus;
pub mod codec;
pub mod commands;
mod driver;
pub mod link;
pub mod memmap;
#[cfg(test)]
pub(crate) mod mock;
pub mod profile;

pub use bus::{CHUNK_ATTEMPTS, CHUNK_OFFSETS, CHUNK_REGISTERS, ReadError, RegisterBus, WriteError};
pub use commands::{Command, CommandMode, RegisterValue};
pub use driver::{Rover, RoverError};
pub use link::{SerialTransport, Transport, TransportError};
pub use memmap::RegisterMap;
pub use profile::{Capabilities, Identity, RoverProfile};
