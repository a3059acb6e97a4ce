use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use substrate_core::{Message, Result, SessionId, SubstrateError};
use substrate_memory::MemoryStore;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tracing::{debug, info};

/// One conversation's state between turns.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Append-only, totally ordered history.
    pub messages: Vec<Message>,
    /// Model used when a turn does not override it.
    pub model: String,
    /// Dispatch cycles in the current turn. Reset at the start of every turn.
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<SessionId>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            model: model.into(),
            iteration: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Exclusive access to a session for the duration of one turn.
/// Dropping the lease (turn finished, failed or cancelled) releases it.
pub struct SessionLease {
    guard: OwnedMutexGuard<Session>,
}

impl Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.guard
    }
}

impl DerefMut for SessionLease {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.guard
    }
}

/// Concurrent map from session id to a guarded session.
///
/// At most one lease per session exists at a time; different sessions are
/// fully independent.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<TokioMutex<Session>>>,
    default_model: String,
    store: Option<Arc<MemoryStore>>,
}

impl SessionRegistry {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            sessions: DashMap::new(),
            default_model: default_model.into(),
            store: None,
        }
    }

    /// Histories are loaded from `store` on first use and written back on commit.
    pub fn with_store(default_model: impl Into<String>, store: Arc<MemoryStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(default_model)
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<TokioMutex<Session>>> {
        if let Some(slot) = self.sessions.get(id) {
            return Ok(Arc::clone(&slot));
        }

        let mut session = Session::new(id, self.default_model.clone());
        if let Some(ref store) = self.store {
            session.messages = store.load_session_messages(id)?;
            if !session.messages.is_empty() {
                info!(session = %id, messages = session.messages.len(), "restored session history");
            }
        }
        let slot = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(TokioMutex::new(session)));
        Ok(Arc::clone(&slot))
    }

    /// Take the session's lease, creating the session if it is new.
    /// Fails with `SessionBusy` if a turn already holds it.
    pub fn acquire(&self, id: &str) -> Result<SessionLease> {
        let slot = self.slot(id)?;
        match slot.try_lock_owned() {
            Ok(guard) => {
                debug!(session = %id, "session lease acquired");
                Ok(SessionLease { guard })
            }
            Err(_) => Err(SubstrateError::SessionBusy(id.to_string())),
        }
    }

    /// Append a finished turn's messages. Persists before publishing, so a
    /// failed write leaves both the store and the session unchanged.
    pub fn commit(&self, lease: &mut SessionLease, new_messages: Vec<Message>) -> Result<()> {
        if new_messages.is_empty() {
            return Ok(());
        }
        if let Some(ref store) = self.store {
            let mut all = lease.messages.clone();
            all.extend(new_messages.iter().cloned());
            store.save_session_messages(&lease.id, &all)?;
        }
        let added = new_messages.len();
        lease.messages.extend(new_messages);
        lease.updated_at = Utc::now();
        debug!(session = %lease.id, added, total = lease.messages.len(), "committed turn");
        Ok(())
    }

    /// Snapshot of a session's history. Fails with `SessionBusy` mid-turn.
    pub fn history(&self, id: &str) -> Result<Vec<Message>> {
        let slot = self
            .sessions
            .get(id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| SubstrateError::SessionNotFound(id.to_string()))?;
        let session = slot
            .try_lock()
            .map_err(|_| SubstrateError::SessionBusy(id.to_string()))?;
        Ok(session.messages.clone())
    }

    pub fn is_busy(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|s| s.try_lock().is_err())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Forget a session in memory and in the store. Busy sessions are kept.
    pub fn remove(&self, id: &str) -> Result<bool> {
        if self.is_busy(id) {
            return Err(SubstrateError::SessionBusy(id.to_string()));
        }
        let existed = self.sessions.remove(id).is_some();
        let persisted = match self.store {
            Some(ref store) => store.delete_session(id)?,
            None => false,
        };
        Ok(existed || persisted)
    }
}
