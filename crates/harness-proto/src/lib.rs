//! Shared protocol definitions for controller ↔ worker communication.
//! Keeping this in a dedicated crate lets workers written against other
//! runtimes mirror the token values without pulling in the async stack.

mod sequence;
mod wire;

pub use sequence::{Role, SessionPhase};
pub use wire::{decode_token, encode_token, TOKEN_LEN};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Control messages exchanged over a session. Commands carry no payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Command {
    /// Worker is idle and may be told to start a trial.
    Ready = 1,
    /// Controller has armed measurement; the worker runs the payload now.
    Go = 2,
    /// Worker finished the payload for this trial.
    Done = 3,
    /// Worker payload failure, or controller abort in place of `Go`.
    Error = 4,
}

impl Command {
    pub const ALL: [Command; 4] = [Command::Ready, Command::Go, Command::Done, Command::Error];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Command::Ready),
            2 => Some(Command::Go),
            3 => Some(Command::Done),
            4 => Some(Command::Error),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Ready => "ready",
            Command::Go => "go",
            Command::Done => "done",
            Command::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command token {0:#010x}")]
    UnknownToken(u32),
    #[error("stream closed mid-token after {received} of {TOKEN_LEN} bytes")]
    Truncated { received: usize },
    #[error("{sender} may not send `{command}` while the session is {phase}")]
    OutOfSequence {
        sender: Role,
        command: Command,
        phase: SessionPhase,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_are_stable() {
        assert_eq!(Command::Ready.as_u32(), 1);
        assert_eq!(Command::Go.as_u32(), 2);
        assert_eq!(Command::Done.as_u32(), 3);
        assert_eq!(Command::Error.as_u32(), 4);
        for command in Command::ALL {
            assert_eq!(Command::from_u32(command.as_u32()), Some(command));
        }
        assert_eq!(Command::from_u32(0), None);
        assert_eq!(Command::from_u32(5), None);
    }

    #[test]
    fn commands_serialize_as_snake_case() {
        let json = serde_json::to_string(&Command::Done).expect("serialize");
        assert_eq!(json, "\"done\"");
    }

    #[test]
    fn out_of_sequence_message_names_everything() {
        let err = ProtocolError::OutOfSequence {
            sender: Role::Worker,
            command: Command::Done,
            phase: SessionPhase::AwaitingGo,
        };
        assert_eq!(
            err.to_string(),
            "worker may not send `done` while the session is awaiting-go"
        );
    }
}
