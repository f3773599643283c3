use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Command, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Controller,
    Worker,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Controller => Role::Worker,
            Role::Worker => Role::Controller,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Controller => "controller",
            Role::Worker => "worker",
        })
    }
}

/// Phase of one controller–worker session. Both ends track the same
/// phase and check every command they send or receive against it, so
/// the stream stays strictly alternating: `ready, go, done, ready, …`.
///
/// `Idle` only exists before the worker's first `Ready`; afterwards the
/// worker re-announces straight from `AwaitingAck`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Idle,
    AwaitingGo,
    Executing,
    AwaitingAck,
    Terminated,
}

impl SessionPhase {
    /// Applies `command` sent by `sender`, returning the next phase.
    pub fn advance(self, sender: Role, command: Command) -> Result<SessionPhase, ProtocolError> {
        use SessionPhase::*;

        let next = match (self, sender, command) {
            (Idle, Role::Worker, Command::Ready) => Some(AwaitingGo),
            (AwaitingGo, Role::Controller, Command::Go) => Some(Executing),
            (AwaitingGo, Role::Controller, Command::Error) => Some(Terminated),
            (Executing, Role::Worker, Command::Done) => Some(AwaitingAck),
            (Executing, Role::Worker, Command::Error) => Some(Terminated),
            (AwaitingAck, Role::Worker, Command::Ready) => Some(AwaitingGo),
            _ => None,
        };
        next.ok_or(ProtocolError::OutOfSequence {
            sender,
            command,
            phase: self,
        })
    }

    /// The side expected to speak next, if any.
    pub fn next_sender(self) -> Option<Role> {
        match self {
            SessionPhase::Idle | SessionPhase::Executing | SessionPhase::AwaitingAck => {
                Some(Role::Worker)
            }
            SessionPhase::AwaitingGo => Some(Role::Controller),
            SessionPhase::Terminated => None,
        }
    }

    pub fn is_terminated(self) -> bool {
        self == SessionPhase::Terminated
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionPhase::Idle => "idle",
            SessionPhase::AwaitingGo => "awaiting-go",
            SessionPhase::Executing => "executing",
            SessionPhase::AwaitingAck => "awaiting-ack",
            SessionPhase::Terminated => "terminated",
        })
    }
}
