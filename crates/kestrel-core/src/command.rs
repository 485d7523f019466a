//! Control-channel command codec
//!
//! The master pushes administrative commands to each worker over its
//! control channel as fixed-size records: a single `u32` command in host
//! byte order. Messages are sent and received whole; a short read is an
//! error. Commands are idempotent, so redelivery is harmless.

use crate::error::{ProxyError, ProxyResult};

/// Administrative command carried by one control frame
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Exit at the next loop turn
    Quit = 1,
    /// Stop accepting, drain in-flight work, exit within the shutdown timeout
    Terminate = 2,
    /// Reopen the log sink (rotation)
    LogReopen = 3,
    /// Raise log verbosity one level
    LogLevelUp = 4,
    /// Lower log verbosity one level
    LogLevelDown = 5,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Command> {
        match v {
            1 => Some(Command::Quit),
            2 => Some(Command::Terminate),
            3 => Some(Command::LogReopen),
            4 => Some(Command::LogLevelUp),
            5 => Some(Command::LogLevelDown),
            _ => None,
        }
    }

    pub const ALL: [Command; 5] = [
        Command::Quit,
        Command::Terminate,
        Command::LogReopen,
        Command::LogLevelUp,
        Command::LogLevelDown,
    ];
}

/// One whole control-channel frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtlMsg {
    pub command: Command,
}

/// Size of one framed message on the wire
pub const FRAME_SIZE: usize = 4;

impl CtlMsg {
    pub fn new(command: Command) -> Self {
        CtlMsg { command }
    }

    /// Encode as one fixed-size record in host byte order
    pub fn to_bytes(self) -> [u8; FRAME_SIZE] {
        (self.command as u32).to_ne_bytes()
    }

    /// Decode one whole record; anything shorter or unknown is a bad frame
    pub fn from_bytes(buf: &[u8]) -> ProxyResult<CtlMsg> {
        if buf.len() < FRAME_SIZE {
            return Err(ProxyError::BadFrame);
        }
        let raw = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        match Command::from_u32(raw) {
            Some(command) => Ok(CtlMsg { command }),
            None => Err(ProxyError::BadFrame),
        }
    }
}
