// Remote control: TCP line protocol and UDP datagrams
//
// Both carry the same 8-character commands:
//   STOPZERO     zero every axis and stop
//   SPXnnnnn     speed X, nnnnn a signed decimal in [-10000, 10000]
//   SPYnnnnn     speed Y
//   ROTnnnnn     rotation

pub mod tcp;
pub mod udp;

use crate::config::REMOTE_VALUE_LIMIT;
use crate::messages::Axis;

pub use tcp::{ProtocolViolation, TcpSession};
pub use udp::{DatagramError, DatagramFilter, UdpSession};

pub const COMMAND_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    StopZero,
    Set { axis: Axis, value: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unrecognized command")]
    Unrecognized,

    #[error("Invalid value for {0}")]
    InvalidValue(Axis),
}

impl CommandError {
    /// Negative acknowledgement for this rejection
    pub fn reply(self) -> Reply {
        match self {
            CommandError::Unrecognized => Reply::BadCommand,
            CommandError::InvalidValue(axis) => Reply::BadValue(axis),
        }
    }
}

pub fn parse_command(text: &[u8]) -> Result<RemoteCommand, CommandError> {
    if text.len() != COMMAND_LEN {
        return Err(CommandError::Unrecognized);
    }
    if text == b"STOPZERO" {
        return Ok(RemoteCommand::StopZero);
    }

    let (prefix, argument) = text.split_at(3);
    let axis = match prefix {
        b"SPX" => Axis::X,
        b"SPY" => Axis::Y,
        b"ROT" => Axis::Rotation,
        _ => return Err(CommandError::Unrecognized),
    };

    let value = std::str::from_utf8(argument)
        .ok()
        .and_then(|s| s.trim_start().parse::<i32>().ok())
        .filter(|v| v.abs() <= REMOTE_VALUE_LIMIT)
        .ok_or(CommandError::InvalidValue(axis))?;
    Ok(RemoteCommand::Set { axis, value })
}

/// Replies sent to a TCP peer, each one CRLF-terminated on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    OkZero,
    Ok(Axis),
    BadPassword,
    BadCommand,
    BadValue(Axis),
    Error(Axis),
    /// Watchdog stopped the rover
    NoCommand,
}

impl Reply {
    pub fn token(self) -> &'static str {
        match self {
            Reply::OkZero => "OKZERO",
            Reply::Ok(Axis::X) => "OKSPX",
            Reply::Ok(Axis::Y) => "OKSPY",
            Reply::Ok(Axis::Rotation) => "OKROT",
            Reply::BadPassword => "!BADPWD!",
            Reply::BadCommand => "!BADCMD!",
            Reply::BadValue(Axis::X) => "!BADSPX!",
            Reply::BadValue(Axis::Y) => "!BADSPY!",
            Reply::BadValue(Axis::Rotation) => "!BADROT!",
            Reply::Error(Axis::X) => "!ERRSPX!",
            Reply::Error(Axis::Y) => "!ERRSPY!",
            Reply::Error(Axis::Rotation) => "!ERRROT!",
            Reply::NoCommand => "!NOCMST!",
        }
    }

    pub fn to_wire(self) -> String {
        format!("{}\r\n", self.token())
    }

    /// Acknowledgement for a transmitted axis
    pub fn ack(axis: Axis, delivered: bool) -> Self {
        if delivered { Reply::Ok(axis) } else { Reply::Error(axis) }
    }
}

/// What a remote channel produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEvent {
    Command(RemoteCommand),
    Rejected(CommandError),
    /// Peer went away; the channel is finished
    Disconnected,
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("Peer sent a bad password")]
    BadPassword,

    #[error("Peer did not authenticate in time")]
    AuthTimeout,
}

/// The active remote channel
pub enum RemoteChannel {
    Tcp(TcpSession),
    Udp(UdpSession),
}

impl RemoteChannel {
    pub async fn recv(&mut self) -> Result<RemoteEvent, RemoteError> {
        match self {
            RemoteChannel::Tcp(session) => session.recv().await,
            RemoteChannel::Udp(session) => session.recv().await,
        }
    }

    /// An event that already arrived, if any; never waits
    pub fn try_recv(&mut self) -> Result<Option<RemoteEvent>, RemoteError> {
        match self {
            RemoteChannel::Tcp(session) => session.try_recv(),
            RemoteChannel::Udp(session) => session.try_recv(),
        }
    }

    /// Send a reply; datagram peers get none
    pub async fn reply(&mut self, reply: Reply) -> std::io::Result<()> {
        match self {
            RemoteChannel::Tcp(session) => session.reply(reply).await,
            RemoteChannel::Udp(_) => Ok(()),
        }
    }

    pub async fn close(self) -> std::io::Result<()> {
        match self {
            RemoteChannel::Tcp(session) => session.goodbye().await,
            RemoteChannel::Udp(_) => Ok(()),
        }
    }
}
