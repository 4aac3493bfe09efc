//! Session identity, status, and lookup.
//!
//! A session binds the two legs of one proxied connection to an upstream
//! target and credential. In single-session mode the registry always answers
//! with the configured session; in multi-session mode the id taken from the
//! WebSocket upgrade path selects one of many registered sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use log::debug;

use crate::error::{ProxyError, Result};

/// What the proxy does with a session's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Relay between the legs without observation.
    ProxyPass,
    /// Relay and append every observed message to a recording file.
    RecordingProxy,
}

/// Lifecycle state of a session, driven only by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// Inbound leg accepted, upstream not yet negotiated.
    Init = 0,
    /// Both legs completed their handshakes.
    Active = 1,
    /// A handshake or transport failure ended the session.
    Error = 2,
    /// A leg terminated and the session was torn down cleanly.
    Closed = 3,
}

impl SessionStatus {
    fn from_byte(byte: u8) -> SessionStatus {
        match byte {
            0 => SessionStatus::Init,
            1 => SessionStatus::Active,
            2 => SessionStatus::Error,
            _ => SessionStatus::Closed,
        }
    }
}

/// One proxied session: identity, upstream target, credential, and status.
#[derive(Debug)]
pub struct Session {
    /// Session identifier; the WebSocket path supplies it in multi-session
    /// mode, TCP ingress uses a fixed placeholder id.
    pub id: String,
    /// Whether this session records its traffic.
    pub kind: SessionKind,
    /// Upstream endpoint: `host:port`, or an absolute path for a Unix
    /// domain socket.
    pub target: String,
    /// Password for the upstream server's VNC authentication, if any.
    pub target_password: Option<String>,
    status: AtomicU8,
}

impl Session {
    /// Creates a session in `Init` status.
    pub fn new(
        id: impl Into<String>,
        kind: SessionKind,
        target: impl Into<String>,
        target_password: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            target: target.into(),
            target_password,
            status: AtomicU8::new(SessionStatus::Init as u8),
        })
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_byte(self.status.load(Ordering::Relaxed))
    }

    pub(crate) fn set_status(&self, status: SessionStatus) {
        debug!("session {} status -> {:?}", self.id, status);
        self.status.store(status as u8, Ordering::Relaxed);
    }
}

/// Resolves session ids to sessions.
pub enum SessionRegistry {
    /// Always answers with the one configured session, whatever the id.
    Single(Arc<Session>),
    /// Answers from a map of registered sessions keyed by id.
    Multi(RwLock<HashMap<String, Arc<Session>>>),
}

impl SessionRegistry {
    /// Single-session registry around the given session.
    #[must_use]
    pub fn single(session: Arc<Session>) -> Self {
        SessionRegistry::Single(session)
    }

    /// Empty multi-session registry.
    #[must_use]
    pub fn multi() -> Self {
        SessionRegistry::Multi(RwLock::new(HashMap::new()))
    }

    /// Registers a session under its id.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] on a single-session registry, which
    /// has exactly the one session it was built with.
    pub fn insert(&self, session: Arc<Session>) -> Result<()> {
        match self {
            SessionRegistry::Single(_) => Err(ProxyError::Config(
                "cannot add sessions to a single-session registry".to_string(),
            )),
            SessionRegistry::Multi(sessions) => {
                sessions
                    .write()
                    .expect("session registry lock poisoned")
                    .insert(session.id.clone(), session);
                Ok(())
            }
        }
    }

    /// Resolves a session id.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] when no session matches the id in
    /// multi-session mode.
    pub fn lookup(&self, session_id: &str) -> Result<Arc<Session>> {
        match self {
            SessionRegistry::Single(session) => Ok(session.clone()),
            SessionRegistry::Multi(sessions) => sessions
                .read()
                .expect("session registry lock poisoned")
                .get(session_id)
                .cloned()
                .ok_or_else(|| ProxyError::Config(format!("unknown session id: {session_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_registry_ignores_id() {
        let session = Session::new("main", SessionKind::ProxyPass, "127.0.0.1:5900", None);
        let registry = SessionRegistry::single(session.clone());
        assert_eq!(registry.lookup("anything").unwrap().id, "main");
        assert_eq!(registry.lookup("").unwrap().id, "main");
        assert!(registry.insert(session).is_err());
    }

    #[test]
    fn test_multi_registry_lookup() {
        let registry = SessionRegistry::multi();
        registry
            .insert(Session::new(
                "alpha",
                SessionKind::RecordingProxy,
                "10.0.0.1:5900",
                Some("pw".to_string()),
            ))
            .unwrap();

        let found = registry.lookup("alpha").unwrap();
        assert_eq!(found.kind, SessionKind::RecordingProxy);
        assert!(matches!(
            registry.lookup("beta").unwrap_err(),
            ProxyError::Config(_)
        ));
    }

    #[test]
    fn test_status_transitions() {
        let session = Session::new("s", SessionKind::ProxyPass, "t", None);
        assert_eq!(session.status(), SessionStatus::Init);
        session.set_status(SessionStatus::Active);
        assert_eq!(session.status(), SessionStatus::Active);
        session.set_status(SessionStatus::Closed);
        assert_eq!(session.status(), SessionStatus::Closed);
    }
}
