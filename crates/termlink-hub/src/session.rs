//! Session store: connected sockets and the agent sessions they serve.
//!
//! A session comes into being when an agent says hello and stays active
//! while any agent serves it. After its last agent leaves it lingers for the
//! configured TTL so a restarting agent can pick it up again, then the
//! reaper drops it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use termlink_common::new_id;
use tokio::sync::mpsc;

use crate::relay::{Outbound, SessionResolver, SocketDirectory};

/// Role of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Agent,
}

struct Socket {
    role: Role,
    namespace: String,
    session_id: Option<String>,
    tx: mpsc::UnboundedSender<String>,
}

/// Sessions are scoped by namespace: the same id in two namespaces names two
/// different sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    namespace: String,
    session_id: String,
}

struct Session {
    /// Agent socket ids, in connection order.
    agents: Vec<String>,
    last_seen: Instant,
}

#[derive(Default)]
struct Inner {
    sockets: HashMap<String, Socket>,
    sessions: HashMap<SessionKey, Session>,
}

/// Thread-safe socket and session store.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<RwLock<Inner>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a viewer socket. Returns its socket id.
    pub fn register_viewer(&self, namespace: &str, tx: mpsc::UnboundedSender<String>) -> String {
        let socket_id = new_id();
        self.write().sockets.insert(
            socket_id.clone(),
            Socket {
                role: Role::Viewer,
                namespace: namespace.to_string(),
                session_id: None,
                tx,
            },
        );
        socket_id
    }

    /// Register an agent socket, creating or reviving its session.
    pub fn register_agent(
        &self,
        namespace: &str,
        session_id: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> String {
        let socket_id = new_id();
        let mut inner = self.write();
        inner.sockets.insert(
            socket_id.clone(),
            Socket {
                role: Role::Agent,
                namespace: namespace.to_string(),
                session_id: Some(session_id.to_string()),
                tx,
            },
        );
        let session = inner
            .sessions
            .entry(SessionKey {
                namespace: namespace.to_string(),
                session_id: session_id.to_string(),
            })
            .or_insert_with(|| Session {
                agents: Vec::new(),
                last_seen: Instant::now(),
            });
        session.agents.push(socket_id.clone());
        session.last_seen = Instant::now();
        socket_id
    }

    /// Forget a socket. Returns its role if it was registered.
    pub fn unregister(&self, socket_id: &str) -> Option<Role> {
        let mut inner = self.write();
        let socket = inner.sockets.remove(socket_id)?;
        if let Some(session_id) = socket.session_id {
            let key = SessionKey {
                namespace: socket.namespace,
                session_id,
            };
            if let Some(session) = inner.sessions.get_mut(&key) {
                session.agents.retain(|id| id != socket_id);
                session.last_seen = Instant::now();
            }
        }
        Some(socket.role)
    }

    /// Drop sessions that have had no agent for longer than `max_age`.
    pub fn reap_stale(&self, max_age: Duration) -> usize {
        let mut inner = self.write();
        let now = Instant::now();
        let before = inner.sessions.len();
        inner.sessions.retain(|key, session| {
            let stale = session.agents.is_empty() && now.duration_since(session.last_seen) > max_age;
            if stale {
                tracing::info!(
                    namespace = %key.namespace,
                    session_id = %key.session_id,
                    "Reaping stale session"
                );
            }
            !stale
        });
        before - inner.sessions.len()
    }

    /// Number of known sessions.
    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn socket_count(&self) -> usize {
        self.read().sockets.len()
    }
}

impl SocketDirectory for SessionStore {
    fn namespace_of(&self, socket_id: &str) -> Option<String> {
        self.read()
            .sockets
            .get(socket_id)
            .map(|socket| socket.namespace.clone())
    }

    fn agent_sockets(&self, session_id: &str, namespace: &str) -> Vec<String> {
        let key = SessionKey {
            namespace: namespace.to_string(),
            session_id: session_id.to_string(),
        };
        self.read()
            .sessions
            .get(&key)
            .map(|session| session.agents.clone())
            .unwrap_or_default()
    }

    fn emit(&self, socket_id: &str, frame: Outbound) -> bool {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(socket_id, error = %e, "Failed to encode frame");
                return false;
            }
        };
        match self.read().sockets.get(socket_id) {
            Some(socket) => socket.tx.send(json).is_ok(),
            None => false,
        }
    }
}

impl SessionResolver for SessionStore {
    fn is_active(&self, session_id: &str, namespace: &str) -> bool {
        let key = SessionKey {
            namespace: namespace.to_string(),
            session_id: session_id.to_string(),
        };
        self.read().sessions.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termlink_common::protocol::TerminalEvent;

    #[test]
    fn agent_hello_activates_session_in_its_namespace() {
        let store = SessionStore::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let agent = store.register_agent("team", "s1", tx);

        assert!(store.is_active("s1", "team"));
        assert!(!store.is_active("s1", "other"));
        assert_eq!(store.agent_sockets("s1", "team"), vec![agent.clone()]);
        assert_eq!(store.namespace_of(&agent).as_deref(), Some("team"));
    }

    #[test]
    fn unregister_keeps_session_until_reaped() {
        let store = SessionStore::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let agent = store.register_agent("team", "s1", tx);

        assert_eq!(store.unregister(&agent), Some(Role::Agent));
        assert!(store.namespace_of(&agent).is_none());
        assert!(store.agent_sockets("s1", "team").is_empty());
        assert!(store.is_active("s1", "team"));

        assert_eq!(store.reap_stale(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.reap_stale(Duration::ZERO), 1);
        assert!(!store.is_active("s1", "team"));
    }

    #[test]
    fn sessions_with_agents_are_never_reaped() {
        let store = SessionStore::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        store.register_agent("team", "s1", tx);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.reap_stale(Duration::ZERO), 0);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn emit_queues_json_for_live_sockets() {
        let store = SessionStore::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let viewer = store.register_viewer("team", tx);

        assert!(store.emit(&viewer, Outbound::Event(TerminalEvent::ready("s1", "t1"))));
        let json = rx.try_recv().unwrap();
        assert!(json.contains("\"event\":\"terminal:ready\""));

        assert!(!store.emit("nobody", Outbound::Event(TerminalEvent::ready("s1", "t1"))));
        drop(rx);
        assert!(!store.emit(&viewer, Outbound::Event(TerminalEvent::ready("s1", "t1"))));
    }

    #[test]
    fn unregister_unknown_socket_is_none() {
        let store = SessionStore::new();
        assert_eq!(store.unregister("ghost"), None);
        assert_eq!(store.socket_count(), 0);
    }
}
