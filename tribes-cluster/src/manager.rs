use std::collections::HashMap;

use anyhow::anyhow;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use tribes_core::ext::current_millis;

use crate::message::{ClusterMessage, ClusterMessageBody, DeltaAction};

/// Session manager of one web application as seen by the replication layer.
pub trait ClusterManager: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Ids of sessions invalidated since they were last reported.
    fn invalidated_sessions(&self) -> Vec<String>;

    /// Produces the message describing what happened to a session during the request, if any.
    fn request_completed(&self, session_id: &str) -> Option<ClusterMessage>;

    /// Drops the pending change log of a session without replicating it.
    fn reset_delta_request(&self, session_id: &str);

    /// Forgets invalidated sessions that nobody needs to hear about.
    fn reset_invalidated(&self);

    fn set_primary_session(&self, session_id: &str, primary: bool);

    fn is_primary_session(&self, session_id: &str) -> Option<bool>;

    fn message_received(&self, message: ClusterMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DeltaSession {
    pub id: String,
    pub attributes: HashMap<String, Vec<u8>>,
    pub primary: bool,
    pub last_accessed: i64,
    pending: Vec<DeltaAction>,
}

impl DeltaSession {
    fn new(id: String, primary: bool) -> Self {
        Self {
            id,
            attributes: HashMap::new(),
            primary,
            last_accessed: current_millis(),
            pending: Vec::new(),
        }
    }

    fn apply(&mut self, action: &DeltaAction) {
        match &action.value {
            Some(value) => {
                self.attributes.insert(action.name.clone(), value.clone());
            }
            None => {
                self.attributes.remove(&action.name);
            }
        }
    }
}

/// In-memory sessions that record attribute changes and replicate them as deltas.
#[derive(Debug)]
pub struct DeltaManager {
    name: String,
    sessions: DashMap<String, DeltaSession, ahash::RandomState>,
    invalidated: Mutex<Vec<String>>,
}

impl DeltaManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sessions: DashMap::default(),
            invalidated: Mutex::new(Vec::new()),
        }
    }

    pub fn create_session(&self, session_id: impl Into<String>) -> String {
        let session_id = session_id.into();
        self.sessions.insert(session_id.clone(), DeltaSession::new(session_id.clone(), true));
        session_id
    }

    pub fn session(&self, session_id: &str) -> Option<DeltaSession> {
        self.sessions.get(session_id).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn attribute(&self, session_id: &str, name: &str) -> Option<Vec<u8>> {
        self.sessions.get(session_id).and_then(|s| s.attributes.get(name).cloned())
    }

    pub fn set_attribute(&self, session_id: &str, name: impl Into<String>, value: Vec<u8>) -> anyhow::Result<()> {
        self.record(session_id, DeltaAction { name: name.into(), value: Some(value) })
    }

    pub fn remove_attribute(&self, session_id: &str, name: impl Into<String>) -> anyhow::Result<()> {
        self.record(session_id, DeltaAction { name: name.into(), value: None })
    }

    fn record(&self, session_id: &str, action: DeltaAction) -> anyhow::Result<()> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| anyhow!("session {} not found in {}", session_id, self.name))?;
        session.apply(&action);
        session.last_accessed = current_millis();
        session.pending.push(action);
        Ok(())
    }

    pub fn pending_delta_len(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map_or(0, |s| s.pending.len())
    }

    pub fn invalidate(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            self.invalidated.lock().push(session_id.to_string());
        }
    }
}

impl ClusterManager for DeltaManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn invalidated_sessions(&self) -> Vec<String> {
        self.invalidated.lock().clone()
    }

    fn request_completed(&self, session_id: &str) -> Option<ClusterMessage> {
        {
            let mut invalidated = self.invalidated.lock();
            if let Some(index) = invalidated.iter().position(|id| id == session_id) {
                invalidated.remove(index);
                return Some(ClusterMessage::session_expired(self.name.clone(), session_id));
            }
        }
        let mut session = self.sessions.get_mut(session_id)?;
        if session.pending.is_empty() {
            return None;
        }
        let actions = std::mem::take(&mut session.pending);
        Some(ClusterMessage::session_delta(self.name.clone(), session_id, actions))
    }

    fn reset_delta_request(&self, session_id: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if !session.pending.is_empty() {
                trace!("discarding {} pending changes of session {}", session.pending.len(), session_id);
            }
            session.pending.clear();
        }
    }

    fn reset_invalidated(&self) {
        let mut invalidated = self.invalidated.lock();
        if !invalidated.is_empty() {
            trace!("discarding {} invalidated sessions of {}", invalidated.len(), self.name);
        }
        invalidated.clear();
    }

    fn set_primary_session(&self, session_id: &str, primary: bool) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.primary = primary;
        }
    }

    fn is_primary_session(&self, session_id: &str) -> Option<bool> {
        self.sessions.get(session_id).map(|s| s.primary)
    }

    fn message_received(&self, message: ClusterMessage) -> anyhow::Result<()> {
        match message.body {
            ClusterMessageBody::SessionDelta { session_id, actions } => {
                let mut session = self
                    .sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| DeltaSession::new(session_id.clone(), false));
                for action in &actions {
                    session.apply(action);
                }
                session.primary = false;
                session.last_accessed = current_millis();
                debug!("{} applied {} replicated changes to session {}", self.name, actions.len(), session_id);
            }
            ClusterMessageBody::SessionExpired { session_id } => {
                if self.sessions.remove(&session_id).is_some() {
                    debug!("{} expired replicated session {}", self.name, session_id);
                }
            }
            ClusterMessageBody::Heartbeat => {}
        }
        Ok(())
    }
}
