use std::fmt::{Display, Formatter};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use tribes_core::ext::current_millis;
use tribes_core::member::Member;

/// Recent delivery reliability of one peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SenderStatus {
    Ready,
    Suspect,
    Failing,
}

impl Display for SenderStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SenderStatus::Ready => write!(f, "READY"),
            SenderStatus::Suspect => write!(f, "SUSPECT"),
            SenderStatus::Failing => write!(f, "FAILING"),
        }
    }
}

#[derive(Debug)]
pub struct SenderState {
    status: SenderStatus,
    last_change: i64,
}

impl SenderState {
    fn new() -> Self {
        Self {
            status: SenderStatus::Ready,
            last_change: current_millis(),
        }
    }

    pub fn status(&self) -> SenderStatus {
        self.status
    }

    pub fn last_change(&self) -> i64 {
        self.last_change
    }

    pub fn is_ready(&self) -> bool {
        self.status == SenderStatus::Ready
    }

    pub fn set_ready(&mut self) {
        if self.status != SenderStatus::Ready {
            self.status = SenderStatus::Ready;
            self.last_change = current_millis();
        }
    }

    /// Moves one step towards failing: ready becomes suspect, suspect becomes failing.
    pub fn escalate(&mut self) -> SenderStatus {
        let next = match self.status {
            SenderStatus::Ready => SenderStatus::Suspect,
            SenderStatus::Suspect | SenderStatus::Failing => SenderStatus::Failing,
        };
        if next != self.status {
            self.status = next;
            self.last_change = current_millis();
        }
        next
    }
}

/// Per peer sender state shared by every fan-out sender that talks to that peer.
#[derive(Debug, Default)]
pub struct SenderStateRegistry {
    states: DashMap<Member, Arc<Mutex<SenderState>>, ahash::RandomState>,
}

impl SenderStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, member: &Member) -> Arc<Mutex<SenderState>> {
        self.states
            .entry(member.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SenderState::new())))
            .value()
            .clone()
    }

    pub fn status(&self, member: &Member) -> SenderStatus {
        self.states
            .get(member)
            .map(|state| state.lock().status())
            .unwrap_or(SenderStatus::Ready)
    }

    pub fn set_ready(&self, member: &Member) {
        self.state(member).lock().set_ready();
    }

    pub fn escalate(&self, member: &Member) -> SenderStatus {
        let state = self.state(member);
        let mut state = state.lock();
        let previous = state.status();
        let next = state.escalate();
        if previous == SenderStatus::Ready && next == SenderStatus::Suspect {
            warn!("member {} is now {} after a send failure", member.name(), next);
        }
        next
    }

    pub fn remove(&self, member: &Member) {
        self.states.remove(member);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
