// Scripted transport for unit testing

use std::collections::VecDeque;

use super::codec::{RegisterWidth, encode_value};
use super::link::{Result, Transport, TransportError};
use super::memmap::{FULL_MAP_LEN, MAP_SIZE};

/// Replays queued replies and records every command sent
#[derive(Default)]
pub struct ScriptedTransport {
    replies: VecDeque<Result<Vec<u8>>>,
    pub sent: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw reply
    pub fn reply(&mut self, reply: &[u8]) -> &mut Self {
        self.replies.push_back(Ok(reply.to_vec()));
        self
    }

    /// Queue a transport failure
    pub fn fail(&mut self, error: TransportError) -> &mut Self {
        self.replies.push_back(Err(error));
        self
    }

    /// Queue the three chunk replies of a full map read
    pub fn full_map(&mut self, snapshot: &[u8]) -> &mut Self {
        for chunk in snapshot[..FULL_MAP_LEN].chunks(128) {
            let mut reply = chunk.to_vec();
            reply.extend_from_slice(b"\r\n");
            self.replies.push_back(Ok(reply));
        }
        self
    }

    /// Commands sent so far, as text
    pub fn sent_text(&self) -> Vec<String> {
        self.sent
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }
}

impl Transport for ScriptedTransport {
    fn send_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.sent.push(command.to_vec());
        // An exhausted script behaves like a silent controller
        self.replies.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// A full snapshot of '0' with the given registers filled in
pub fn snapshot(registers: &[(u8, RegisterWidth, u32)]) -> Vec<u8> {
    let mut buffer = vec![b'0'; MAP_SIZE];
    for &(address, width, value) in registers {
        let text = encode_value(width, value).unwrap();
        let start = address as usize * 2;
        buffer[start..start + text.len()].copy_from_slice(text.as_bytes());
    }
    buffer
}
