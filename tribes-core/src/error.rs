use std::fmt::{Display, Formatter};
use std::io;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use crate::member::Member;

/// Why one destination could not be served.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("channel closed by peer")]
    ChannelClosed,
    #[error("received a failed ack from the remote process")]
    RemoteProcess,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("unable to retrieve a sender from the pool within {0:?}")]
    NoSenderAvailable(Duration),
    #[error("sender is disconnected, not retrying")]
    SenderDisconnected,
    #[error("unable to encode message: {0}")]
    Encode(String),
}

impl SendError {
    /// Protocol faults and pool exhaustion fail the destination at once, everything else goes
    /// through the attempt limit. A failed ack is only final under the strict policy.
    pub fn is_retryable(&self, throw_on_failed_ack: bool) -> bool {
        match self {
            SendError::Io(_) | SendError::ChannelClosed => true,
            SendError::RemoteProcess => !throw_on_failed_ack,
            SendError::Protocol(_)
            | SendError::Timeout(_)
            | SendError::NoSenderAvailable(_)
            | SendError::SenderDisconnected
            | SendError::Encode(_) => false,
        }
    }
}

#[derive(Debug)]
pub struct FaultyMember {
    pub member: Member,
    pub cause: SendError,
}

impl Display for FaultyMember {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.member.name(), self.cause)
    }
}

/// Aggregate failure of one send operation. Lists every faulty destination with its cause and
/// the destinations that did complete, so a caller learns the outcome of all of them at once.
#[derive(Debug)]
pub struct ChannelError {
    message: String,
    faulty_members: Vec<FaultyMember>,
    completed: Vec<Member>,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            faulty_members: Vec::new(),
            completed: Vec::new(),
        }
    }

    pub fn with_all<'a>(
        message: impl Into<String>,
        members: impl IntoIterator<Item = &'a Member>,
        cause: impl Fn() -> SendError,
    ) -> Self {
        let mut error = Self::new(message);
        for member in members {
            error.add_faulty_member(member.clone(), cause());
        }
        error
    }

    /// Records a fault, the first cause recorded for a member wins.
    pub fn add_faulty_member(&mut self, member: Member, cause: SendError) -> bool {
        if self.is_faulty(&member) {
            false
        } else {
            self.faulty_members.push(FaultyMember { member, cause });
            true
        }
    }

    pub fn add_completed(&mut self, member: Member) {
        if !self.completed.contains(&member) {
            self.completed.push(member);
        }
    }

    pub fn merge(&mut self, other: ChannelError) {
        for faulty in other.faulty_members {
            self.add_faulty_member(faulty.member, faulty.cause);
        }
        for member in other.completed {
            self.add_completed(member);
        }
    }

    pub fn is_faulty(&self, member: &Member) -> bool {
        self.faulty_members.iter().any(|f| &f.member == member)
    }

    pub fn faulty_members(&self) -> &[FaultyMember] {
        &self.faulty_members
    }

    pub fn completed(&self) -> &[Member] {
        &self.completed
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_empty(&self) -> bool {
        self.faulty_members.is_empty()
    }
}

impl Display for ChannelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if !self.faulty_members.is_empty() {
            write!(f, "; faulty members: [{}]", self.faulty_members.iter().join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ChannelError {}
