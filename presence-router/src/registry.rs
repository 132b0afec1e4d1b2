//! Who is connected, who is online and who may message whom.
//!
//! All state lives behind a single mutex so that every read-then-write
//! sequence (register, status flips, contact edits, routing decisions) is
//! atomic with respect to every other connection task.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::connection::Connection;

pub type SessionId = u64;

/// A live registration. Cheap to clone; carries the outbound connection so
/// callers can reply without going back through the registry.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    username: String,
    connection: Connection,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("username '{0}' is already in use")]
    UsernameTaken(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContactError {
    #[error("cannot add yourself as a contact")]
    SelfReference,
    #[error("'{0}' is already a contact")]
    AlreadyPresent(String),
    #[error("'{0}' has never registered")]
    UnknownUser(String),
    #[error("'{0}' is not a contact")]
    NotPresent(String),
    #[error("session is no longer registered")]
    SessionClosed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("'{0}' is not in the sender's contact list")]
    NotAContact(String),
    #[error("session is no longer registered")]
    SessionClosed,
}

/// Where a private message should go, decided atomically with the
/// authorization check.
#[derive(Debug, Clone)]
pub enum Route {
    Direct(SessionHandle),
    Queue,
}

#[derive(Debug)]
struct Session {
    id: SessionId,
    connection: Connection,
    online: bool,
    contacts: Vec<String>,
}

impl Session {
    fn handle(&self, username: &str) -> SessionHandle {
        SessionHandle {
            id: self.id,
            username: username.to_string(),
            connection: self.connection.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<String, Session>,
    known: HashSet<String>,
}

impl RegistryState {
    fn session_mut(&mut self, handle: &SessionHandle) -> Option<&mut Session> {
        self.sessions
            .get_mut(&handle.username)
            .filter(|session| session.id == handle.id)
    }

    fn session(&self, handle: &SessionHandle) -> Option<&Session> {
        self.sessions
            .get(&handle.username)
            .filter(|session| session.id == handle.id)
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn register(
        &self,
        username: &str,
        connection: Connection,
    ) -> Result<SessionHandle, RegisterError> {
        let mut state = self.state.lock().await;

        if state.sessions.contains_key(username) {
            return Err(RegisterError::UsernameTaken(username.to_string()));
        }

        let session = Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            connection,
            online: true,
            contacts: Vec::new(),
        };
        let handle = session.handle(username);
        state.known.insert(username.to_string());
        state.sessions.insert(username.to_string(), session);
        Ok(handle)
    }

    /// Removes the session behind `handle`. Returns whether anything was
    /// removed; a stale handle never evicts a newer session for the same name.
    pub async fn unregister(&self, handle: &SessionHandle) -> bool {
        let mut state = self.state.lock().await;
        if state.session(handle).is_none() {
            debug!(username = %handle.username, "session already unregistered");
            return false;
        }
        state.sessions.remove(&handle.username);
        true
    }

    pub async fn set_status(&self, handle: &SessionHandle, online: bool) -> bool {
        let mut state = self.state.lock().await;
        match state.session_mut(handle) {
            Some(session) => {
                session.online = online;
                true
            }
            None => false,
        }
    }

    /// Adds `name` to the holder's contacts and returns the resulting list.
    pub async fn add_contact(
        &self,
        handle: &SessionHandle,
        name: &str,
    ) -> Result<Vec<String>, ContactError> {
        if name == handle.username {
            return Err(ContactError::SelfReference);
        }

        let mut state = self.state.lock().await;
        let known = state.known.contains(name);
        let session = state
            .session_mut(handle)
            .ok_or(ContactError::SessionClosed)?;

        if session.contacts.iter().any(|contact| contact == name) {
            return Err(ContactError::AlreadyPresent(name.to_string()));
        }
        if !known {
            return Err(ContactError::UnknownUser(name.to_string()));
        }

        session.contacts.push(name.to_string());
        Ok(session.contacts.clone())
    }

    /// Removes `name` from the holder's contacts and returns the resulting list.
    pub async fn remove_contact(
        &self,
        handle: &SessionHandle,
        name: &str,
    ) -> Result<Vec<String>, ContactError> {
        let mut state = self.state.lock().await;
        let session = state
            .session_mut(handle)
            .ok_or(ContactError::SessionClosed)?;

        let position = session
            .contacts
            .iter()
            .position(|contact| contact == name)
            .ok_or_else(|| ContactError::NotPresent(name.to_string()))?;
        session.contacts.remove(position);
        Ok(session.contacts.clone())
    }

    pub async fn lookup_by_username(&self, name: &str) -> Option<SessionHandle> {
        let state = self.state.lock().await;
        state.sessions.get(name).map(|session| session.handle(name))
    }

    pub async fn is_online(&self, name: &str) -> bool {
        let state = self.state.lock().await;
        state
            .sessions
            .get(name)
            .is_some_and(|session| session.online)
    }

    /// Contacts in insertion order; empty for a handle that is no longer live.
    pub async fn contacts_of(&self, handle: &SessionHandle) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .session(handle)
            .map(|session| session.contacts.clone())
            .unwrap_or_default()
    }

    /// Authorizes a private message from `handle` to `target` against the
    /// sender's contacts and resolves where it should be delivered.
    pub async fn route(&self, handle: &SessionHandle, target: &str) -> Result<Route, RouteError> {
        let state = self.state.lock().await;
        let sender = state.session(handle).ok_or(RouteError::SessionClosed)?;

        if !sender.contacts.iter().any(|contact| contact == target) {
            return Err(RouteError::NotAContact(target.to_string()));
        }

        let route = match state.sessions.get(target) {
            Some(session) if session.online => Route::Direct(session.handle(target)),
            _ => Route::Queue,
        };
        Ok(route)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn live_sessions(&self) -> Vec<SessionHandle> {
        let state = self.state.lock().await;
        state
            .sessions
            .iter()
            .map(|(username, session)| session.handle(username))
            .collect()
    }
}
