use std::fmt::{Display, Formatter};

use bincode::{Decode, Encode};

use tribes_core::ext::{current_millis, decode_bytes, encode_bytes};
use tribes_core::member::Member;

/// One recorded attribute change, `None` removes the attribute.
#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub struct DeltaAction {
    pub name: String,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Eq, PartialEq, Encode, Decode)]
pub enum ClusterMessageBody {
    SessionDelta { session_id: String, actions: Vec<DeltaAction> },
    SessionExpired { session_id: String },
    Heartbeat,
}

/// Addressed, timestamped replication payload. The address is stamped with the local member
/// on send and with the sending member on receipt.
#[derive(Debug, Clone, Encode, Decode)]
pub struct ClusterMessage {
    pub address: Option<Member>,
    pub timestamp: i64,
    pub context_name: String,
    pub body: ClusterMessageBody,
}

impl ClusterMessage {
    pub fn new(context_name: impl Into<String>, body: ClusterMessageBody) -> Self {
        Self {
            address: None,
            timestamp: current_millis(),
            context_name: context_name.into(),
            body,
        }
    }

    pub fn session_delta(context_name: impl Into<String>, session_id: impl Into<String>, actions: Vec<DeltaAction>) -> Self {
        Self::new(context_name, ClusterMessageBody::SessionDelta { session_id: session_id.into(), actions })
    }

    pub fn session_expired(context_name: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self::new(context_name, ClusterMessageBody::SessionExpired { session_id: session_id.into() })
    }

    pub fn session_id(&self) -> Option<&str> {
        match &self.body {
            ClusterMessageBody::SessionDelta { session_id, .. } | ClusterMessageBody::SessionExpired { session_id } => {
                Some(session_id.as_str())
            }
            ClusterMessageBody::Heartbeat => None,
        }
    }

    pub fn unique_id(&self) -> String {
        match self.session_id() {
            Some(session_id) => format!("{}-{}", session_id, self.timestamp),
            None => format!("heartbeat-{}", self.timestamp),
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        encode_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        decode_bytes(bytes)
    }
}

impl Display for ClusterMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.body {
            ClusterMessageBody::SessionDelta { actions, .. } => format!("delta({})", actions.len()),
            ClusterMessageBody::SessionExpired { .. } => "expired".to_string(),
            ClusterMessageBody::Heartbeat => "heartbeat".to_string(),
        };
        write!(f, "ClusterMessage({}, {}, {})", self.context_name, kind, self.unique_id())
    }
}
