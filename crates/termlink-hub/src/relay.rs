//! Terminal relay handlers: validate viewer requests, keep the registry in
//! step, and route frames between viewers and agents.
//!
//! Handlers are synchronous. Frames go out through the `SocketDirectory`,
//! whose `emit` only queues onto the socket's outbound channel.

use std::sync::{Arc, Weak};

use serde::Serialize;
use termlink_common::protocol::{
    AgentRequest, AttachTerminal, CloseTerminal, CreateTerminal, OpenTerminal, ResizeTerminal,
    SessionClose, SessionResize, SessionWrite, TerminalEvent, ViewerRequest, WriteTerminal,
};
use termlink_common::{ErrorCode, TerminalError};
use termlink_config::HubConfig;

use crate::registry::{
    RegistryCallbacks, RegistryOptions, RemovalReason, TerminalRegistry, TerminalRegistryEntry,
};

/// A frame the hub sends to a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Event(TerminalEvent),
    Request(AgentRequest),
}

/// Connected sockets, as seen by the relay.
pub trait SocketDirectory: Send + Sync {
    /// Namespace a connected socket belongs to; `None` once it is gone.
    fn namespace_of(&self, socket_id: &str) -> Option<String>;

    /// Agent sockets serving `session_id` in `namespace`, oldest first.
    fn agent_sockets(&self, session_id: &str, namespace: &str) -> Vec<String>;

    /// Queue a frame for a socket. Returns false if it could not be queued.
    fn emit(&self, socket_id: &str, frame: Outbound) -> bool;
}

pub trait SessionResolver: Send + Sync {
    fn is_active(&self, session_id: &str, namespace: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    pub max_terminals_per_socket: usize,
    pub max_terminals_per_session: usize,
}

impl From<&HubConfig> for RelayLimits {
    fn from(config: &HubConfig) -> Self {
        Self {
            max_terminals_per_socket: config.max_terminals_per_socket,
            max_terminals_per_session: config.max_terminals_per_session,
        }
    }
}

pub struct TerminalRelay {
    registry: TerminalRegistry,
    directory: Arc<dyn SocketDirectory>,
    sessions: Arc<dyn SessionResolver>,
    limits: RelayLimits,
}

impl TerminalRelay {
    pub fn new(
        options: RegistryOptions,
        limits: RelayLimits,
        directory: Arc<dyn SocketDirectory>,
        sessions: Arc<dyn SessionResolver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let on_expired = weak.clone();
            let on_idle = weak.clone();
            let callbacks = RegistryCallbacks {
                on_expired: Some(Box::new(move |entry| {
                    if let Some(relay) = on_expired.upgrade() {
                        relay.on_keep_alive_expired(entry);
                    }
                })),
                on_idle: Some(Box::new(move |entry| {
                    if let Some(relay) = on_idle.upgrade() {
                        relay.on_idle_expired(entry);
                    }
                })),
            };
            Self {
                registry: TerminalRegistry::new(options, callbacks),
                directory,
                sessions,
                limits,
            }
        })
    }

    pub fn from_config(
        config: &HubConfig,
        directory: Arc<dyn SocketDirectory>,
        sessions: Arc<dyn SessionResolver>,
    ) -> Arc<Self> {
        Self::new(
            RegistryOptions::from(config),
            RelayLimits::from(config),
            directory,
            sessions,
        )
    }

    pub fn registry(&self) -> &TerminalRegistry {
        &self.registry
    }

    // =========================================================================
    // VIEWER REQUESTS
    // =========================================================================

    pub fn handle_viewer(&self, socket_id: &str, request: ViewerRequest) {
        match request {
            ViewerRequest::Create(req) => self.handle_create(socket_id, req),
            ViewerRequest::Attach(req) => self.handle_attach(socket_id, req),
            ViewerRequest::Write(req) => self.handle_write(socket_id, req),
            ViewerRequest::Resize(req) => self.handle_resize(socket_id, req),
            ViewerRequest::Close(req) => self.handle_close(socket_id, req),
        }
    }

    pub fn handle_create(&self, socket_id: &str, req: CreateTerminal) {
        let Some(namespace) = self.directory.namespace_of(socket_id) else {
            return;
        };
        let (session_id, terminal_id) = (req.session_id.as_str(), req.terminal_id.as_str());

        if !self.sessions.is_active(session_id, &namespace) {
            self.fail(
                socket_id,
                session_id,
                terminal_id,
                ErrorCode::SessionUnavailable,
                "session is not active",
            );
            return;
        }

        if self.registry.count_for_socket(socket_id) >= self.limits.max_terminals_per_socket {
            self.fail(
                socket_id,
                session_id,
                terminal_id,
                ErrorCode::TooManyTerminals,
                format!(
                    "at most {} terminals per connection",
                    self.limits.max_terminals_per_socket
                ),
            );
            return;
        }
        if self.registry.count_for_session(session_id) >= self.limits.max_terminals_per_session {
            self.fail(
                socket_id,
                session_id,
                terminal_id,
                ErrorCode::TooManyTerminals,
                format!(
                    "at most {} terminals per session",
                    self.limits.max_terminals_per_session
                ),
            );
            return;
        }

        let Some(agent_socket_id) = self
            .directory
            .agent_sockets(session_id, &namespace)
            .into_iter()
            .next()
        else {
            self.fail(
                socket_id,
                session_id,
                terminal_id,
                ErrorCode::CliNotConnected,
                "no agent is connected for this session",
            );
            return;
        };

        if self
            .registry
            .register(terminal_id, session_id, socket_id, &agent_socket_id)
            .is_none()
        {
            self.fail(
                socket_id,
                session_id,
                terminal_id,
                ErrorCode::TerminalAlreadyExists,
                format!("terminal {terminal_id} already exists"),
            );
            return;
        }

        let open = Outbound::Request(AgentRequest::Open(OpenTerminal::from(&req)));
        if !self.directory.emit(&agent_socket_id, open) {
            self.registry.remove(terminal_id);
            self.fail(
                socket_id,
                session_id,
                terminal_id,
                ErrorCode::CliNotConnected,
                "agent could not be reached",
            );
            return;
        }

        tracing::info!(
            socket_id,
            session_id,
            terminal_id,
            agent = %agent_socket_id,
            "Terminal created"
        );
    }

    pub fn handle_attach(&self, socket_id: &str, req: AttachTerminal) {
        let Some(namespace) = self.directory.namespace_of(socket_id) else {
            return;
        };
        let (session_id, terminal_id) = (req.session_id.as_str(), req.terminal_id.as_str());

        if let Some(entry) = self.registry.get(terminal_id) {
            match self.directory.namespace_of(&entry.agent_socket_id) {
                None => {
                    self.registry
                        .remove_with_reason(terminal_id, RemovalReason::CliDisconnected);
                    self.fail(
                        socket_id,
                        session_id,
                        terminal_id,
                        ErrorCode::CliDisconnected,
                        "the agent hosting this terminal disconnected",
                    );
                    return;
                }
                Some(agent_namespace) if agent_namespace != namespace => {
                    self.fail(
                        socket_id,
                        session_id,
                        terminal_id,
                        ErrorCode::TerminalNotFound,
                        "terminal not found",
                    );
                    return;
                }
                Some(_) => {}
            }
        }

        match self.registry.attach_to_socket(terminal_id, session_id, socket_id) {
            Ok(entry) => {
                tracing::info!(socket_id, terminal_id, "Terminal attached");
                self.directory.emit(
                    socket_id,
                    Outbound::Event(TerminalEvent::ready(&entry.session_id, terminal_id)),
                );
            }
            Err(code) => {
                let message = match code {
                    ErrorCode::CliDisconnected => "the agent hosting this terminal disconnected",
                    _ => "terminal not found or not attachable",
                };
                self.fail(socket_id, session_id, terminal_id, code, message);
            }
        }
    }

    pub fn handle_write(&self, socket_id: &str, req: WriteTerminal) {
        let Some(entry) = self.owned_entry(socket_id, &req.terminal_id) else {
            return;
        };
        let request = AgentRequest::Write(SessionWrite {
            session_id: entry.session_id.clone(),
            terminal_id: req.terminal_id,
            data: req.data,
        });
        self.forward_from_owner(socket_id, &entry, request);
    }

    pub fn handle_resize(&self, socket_id: &str, req: ResizeTerminal) {
        let Some(entry) = self.owned_entry(socket_id, &req.terminal_id) else {
            return;
        };
        let request = AgentRequest::Resize(SessionResize {
            session_id: entry.session_id.clone(),
            terminal_id: req.terminal_id,
            cols: req.cols,
            rows: req.rows,
        });
        self.forward_from_owner(socket_id, &entry, request);
    }

    /// Close by the owner, or by a reconnecting viewer that presents the
    /// session of an orphaned terminal. Anything else is ignored.
    pub fn handle_close(&self, socket_id: &str, req: CloseTerminal) {
        let Some(entry) = self.registry.get(&req.terminal_id) else {
            return;
        };

        let allowed = entry.is_owned_by(socket_id) || {
            entry.is_orphaned()
                && req.session_id.as_deref() == Some(entry.session_id.as_str())
                && self
                    .directory
                    .namespace_of(socket_id)
                    .is_some_and(|namespace| self.sessions.is_active(&entry.session_id, &namespace))
        };
        if !allowed {
            tracing::debug!(socket_id, terminal_id = %req.terminal_id, "Ignoring close from non-owner");
            return;
        }

        self.send_close(&entry);
        self.registry.remove(&entry.terminal_id);
        tracing::info!(socket_id, terminal_id = %entry.terminal_id, "Terminal closed");
    }

    // =========================================================================
    // DISCONNECTS
    // =========================================================================

    /// A viewer socket went away. Its terminals stay alive for the
    /// keep-alive period; the agent is not told.
    pub fn handle_viewer_disconnect(&self, socket_id: &str) {
        self.registry.orphan_by_socket(socket_id);
    }

    pub fn handle_agent_disconnect(&self, socket_id: &str) {
        let removed = self.registry.remove_by_cli_disconnect(socket_id);
        if removed.is_empty() {
            return;
        }
        tracing::warn!(socket_id, count = removed.len(), "Agent disconnected with open terminals");

        for entry in removed {
            if let Some(owner) = &entry.owner_socket_id {
                self.directory.emit(
                    owner,
                    Outbound::Event(TerminalEvent::error(
                        &entry.session_id,
                        &entry.terminal_id,
                        TerminalError::new(ErrorCode::CliDisconnected, "the agent disconnected"),
                    )),
                );
            }
        }
    }

    // =========================================================================
    // AGENT EVENTS
    // =========================================================================

    /// Relay an event from an agent to the terminal's owner. Only the agent
    /// the terminal is bound to may speak for it.
    pub fn handle_agent_event(&self, socket_id: &str, event: TerminalEvent) {
        let terminal_id = event.terminal_id().to_string();
        let Some(entry) = self.registry.get(&terminal_id) else {
            tracing::debug!(socket_id, terminal_id = %terminal_id, "Event for unknown terminal dropped");
            return;
        };
        if entry.agent_socket_id != socket_id {
            tracing::warn!(socket_id, terminal_id = %terminal_id, "Event from unbound agent dropped");
            return;
        }

        match &event {
            TerminalEvent::Output(_) => self.registry.mark_activity(&terminal_id),
            TerminalEvent::Exit(exit) => {
                tracing::info!(terminal_id = %terminal_id, code = ?exit.code, "Terminal exited");
                self.registry.remove(&terminal_id);
            }
            TerminalEvent::Error(failure) => {
                tracing::warn!(terminal_id = %terminal_id, code = %failure.code, "Terminal failed: {}", failure.message);
                self.registry.remove(&terminal_id);
            }
            TerminalEvent::Ready(_) => {}
        }

        if let Some(owner) = &entry.owner_socket_id {
            self.directory.emit(owner, Outbound::Event(event));
        }
    }

    // =========================================================================
    // EXPIRY
    // =========================================================================

    fn on_keep_alive_expired(&self, entry: TerminalRegistryEntry) {
        self.send_close(&entry);
    }

    fn on_idle_expired(&self, entry: TerminalRegistryEntry) {
        self.send_close(&entry);
        if let Some(owner) = &entry.owner_socket_id {
            self.directory.emit(
                owner,
                Outbound::Event(TerminalEvent::error(
                    &entry.session_id,
                    &entry.terminal_id,
                    TerminalError::new(ErrorCode::TerminalNotFound, "terminal closed after inactivity"),
                )),
            );
        }
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    fn owned_entry(&self, socket_id: &str, terminal_id: &str) -> Option<TerminalRegistryEntry> {
        self.registry
            .get(terminal_id)
            .filter(|entry| entry.is_owned_by(socket_id))
    }

    fn forward_from_owner(&self, socket_id: &str, entry: &TerminalRegistryEntry, request: AgentRequest) {
        if self
            .directory
            .emit(&entry.agent_socket_id, Outbound::Request(request))
        {
            self.registry.mark_activity(&entry.terminal_id);
            return;
        }

        self.registry
            .remove_with_reason(&entry.terminal_id, RemovalReason::CliDisconnected);
        self.fail(
            socket_id,
            &entry.session_id,
            &entry.terminal_id,
            ErrorCode::CliDisconnected,
            "the agent hosting this terminal disconnected",
        );
    }

    fn send_close(&self, entry: &TerminalRegistryEntry) {
        let close = AgentRequest::Close(SessionClose {
            session_id: entry.session_id.clone(),
            terminal_id: entry.terminal_id.clone(),
        });
        if !self
            .directory
            .emit(&entry.agent_socket_id, Outbound::Request(close))
        {
            tracing::debug!(terminal_id = %entry.terminal_id, "Agent gone, close not delivered");
        }
    }

    fn fail(
        &self,
        socket_id: &str,
        session_id: &str,
        terminal_id: &str,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        let error = TerminalError::new(code, message);
        tracing::debug!(socket_id, terminal_id, %error, "Rejecting terminal request");
        self.directory.emit(
            socket_id,
            Outbound::Event(TerminalEvent::error(session_id, terminal_id, error)),
        );
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-memory sockets: socket → namespace, session → agents, and a log
    /// of every emitted frame.
    #[derive(Default)]
    struct FakeDirectory {
        namespaces: Mutex<HashMap<String, String>>,
        agents: Mutex<HashMap<(String, String), Vec<String>>>,
        unreachable: Mutex<HashSet<String>>,
        sent: Mutex<Vec<(String, Outbound)>>,
        active: Mutex<HashSet<(String, String)>>,
    }

    impl FakeDirectory {
        fn viewer(&self, socket: &str, namespace: &str) {
            self.namespaces
                .lock()
                .unwrap()
                .insert(socket.into(), namespace.into());
        }

        fn agent(&self, socket: &str, namespace: &str, session: &str) {
            self.viewer(socket, namespace);
            self.agents
                .lock()
                .unwrap()
                .entry((session.into(), namespace.into()))
                .or_default()
                .push(socket.into());
            self.active
                .lock()
                .unwrap()
                .insert((session.into(), namespace.into()));
        }

        fn drop_socket(&self, socket: &str) {
            self.namespaces.lock().unwrap().remove(socket);
            for agents in self.agents.lock().unwrap().values_mut() {
                agents.retain(|s| s != socket);
            }
        }

        fn unreachable(&self, socket: &str) {
            self.unreachable.lock().unwrap().insert(socket.into());
        }

        fn take_sent(&self) -> Vec<(String, Outbound)> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        /// Error codes emitted to `socket`, in order.
        fn errors_to(sent: &[(String, Outbound)], socket: &str) -> Vec<ErrorCode> {
            sent.iter()
                .filter(|(to, _)| to == socket)
                .filter_map(|(_, frame)| match frame {
                    Outbound::Event(TerminalEvent::Error(failure)) => Some(failure.code),
                    _ => None,
                })
                .collect()
        }
    }

    impl SocketDirectory for FakeDirectory {
        fn namespace_of(&self, socket_id: &str) -> Option<String> {
            self.namespaces.lock().unwrap().get(socket_id).cloned()
        }

        fn agent_sockets(&self, session_id: &str, namespace: &str) -> Vec<String> {
            self.agents
                .lock()
                .unwrap()
                .get(&(session_id.to_string(), namespace.to_string()))
                .cloned()
                .unwrap_or_default()
        }

        fn emit(&self, socket_id: &str, frame: Outbound) -> bool {
            if self.unreachable.lock().unwrap().contains(socket_id)
                || !self.namespaces.lock().unwrap().contains_key(socket_id)
            {
                return false;
            }
            self.sent.lock().unwrap().push((socket_id.into(), frame));
            true
        }
    }

    impl SessionResolver for FakeDirectory {
        fn is_active(&self, session_id: &str, namespace: &str) -> bool {
            self.active
                .lock()
                .unwrap()
                .contains(&(session_id.to_string(), namespace.to_string()))
        }
    }

    fn limits(per_socket: usize, per_session: usize) -> RelayLimits {
        RelayLimits {
            max_terminals_per_socket: per_socket,
            max_terminals_per_session: per_session,
        }
    }

    fn options(keep_alive_ms: u64, idle_ms: Option<u64>) -> RegistryOptions {
        RegistryOptions {
            keep_alive: Duration::from_millis(keep_alive_ms),
            idle_timeout: idle_ms.map(Duration::from_millis),
            removal_reason_ttl: Duration::from_secs(60),
        }
    }

    /// Relay with viewer `v1` and agent `a1` serving `s1`, both in `ns`.
    fn setup(limits: RelayLimits, options: RegistryOptions) -> (Arc<TerminalRelay>, Arc<FakeDirectory>) {
        let directory = Arc::new(FakeDirectory::default());
        directory.viewer("v1", "ns");
        directory.agent("a1", "ns", "s1");
        let relay = TerminalRelay::new(
            options,
            limits,
            Arc::clone(&directory) as Arc<dyn SocketDirectory>,
            Arc::clone(&directory) as Arc<dyn SessionResolver>,
        );
        (relay, directory)
    }

    fn create(terminal_id: &str) -> ViewerRequest {
        ViewerRequest::Create(CreateTerminal {
            session_id: "s1".into(),
            terminal_id: terminal_id.into(),
            cols: 80,
            rows: 24,
            shell: None,
            shell_options: vec![],
        })
    }

    fn write(terminal_id: &str, data: &str) -> ViewerRequest {
        ViewerRequest::Write(WriteTerminal {
            terminal_id: terminal_id.into(),
            data: data.into(),
        })
    }

    fn attach(terminal_id: &str) -> ViewerRequest {
        ViewerRequest::Attach(AttachTerminal {
            session_id: "s1".into(),
            terminal_id: terminal_id.into(),
        })
    }

    fn close(terminal_id: &str, session_id: Option<&str>) -> ViewerRequest {
        ViewerRequest::Close(CloseTerminal {
            terminal_id: terminal_id.into(),
            session_id: session_id.map(String::from),
        })
    }

    fn output(terminal_id: &str, data: &str) -> TerminalEvent {
        TerminalEvent::Output(termlink_common::protocol::TerminalOutput {
            session_id: "s1".into(),
            terminal_id: terminal_id.into(),
            data: data.into(),
        })
    }

    // -------------------------------------------------------------------------
    // create
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn create_forwards_open_to_agent() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));

        let sent = dir.take_sent();
        assert_eq!(sent.len(), 1);
        let (to, frame) = &sent[0];
        assert_eq!(to, "a1");
        match frame {
            Outbound::Request(AgentRequest::Open(open)) => {
                assert_eq!(open.terminal_id, "t1");
                assert_eq!(open.session_id, "s1");
            }
            other => panic!("expected open, got {other:?}"),
        }
        assert_eq!(relay.registry().count_for_socket("v1"), 1);
    }

    #[tokio::test]
    async fn create_in_inactive_session_is_unavailable() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        dir.viewer("v-other", "other-ns");
        relay.handle_viewer("v-other", create("t1"));

        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v-other"),
            vec![ErrorCode::SessionUnavailable]
        );
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn quota_per_socket_is_enforced() {
        let (relay, dir) = setup(limits(2, 8), options(1_000, None));
        for id in ["t1", "t2", "t3"] {
            relay.handle_viewer("v1", create(id));
        }

        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v1"),
            vec![ErrorCode::TooManyTerminals]
        );
        assert_eq!(relay.registry().count_for_socket("v1"), 2);
    }

    #[tokio::test]
    async fn quota_per_session_counts_orphans() {
        let (relay, dir) = setup(limits(4, 2), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer("v1", create("t2"));
        relay.handle_viewer_disconnect("v1");

        dir.viewer("v2", "ns");
        relay.handle_viewer("v2", create("t3"));

        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v2"),
            vec![ErrorCode::TooManyTerminals]
        );
        assert_eq!(relay.registry().count_for_session("s1"), 2);
    }

    #[tokio::test]
    async fn create_without_agent_is_cli_not_connected() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        dir.drop_socket("a1");
        relay.handle_viewer("v1", create("t1"));

        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v1"),
            vec![ErrorCode::CliNotConnected]
        );
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer("v1", create("t1"));

        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v1"),
            vec![ErrorCode::TerminalAlreadyExists]
        );
    }

    #[tokio::test]
    async fn undeliverable_open_rolls_back() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        dir.unreachable("a1");
        relay.handle_viewer("v1", create("t1"));

        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v1"),
            vec![ErrorCode::CliNotConnected]
        );
        assert!(relay.registry().get("t1").is_none());
    }

    // -------------------------------------------------------------------------
    // ownership
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn only_owner_may_write_or_resize() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        dir.viewer("v2", "ns");
        relay.handle_viewer("v1", create("t1"));
        dir.take_sent();

        relay.handle_viewer("v2", write("t1", "rm -rf /\n"));
        relay.handle_viewer(
            "v2",
            ViewerRequest::Resize(ResizeTerminal {
                terminal_id: "t1".into(),
                cols: 1,
                rows: 1,
            }),
        );
        assert!(dir.take_sent().is_empty());

        relay.handle_viewer("v1", write("t1", "ls\n"));
        let sent = dir.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            (to, Outbound::Request(AgentRequest::Write(w))) if to == "a1" && w.data == "ls\n" && w.session_id == "s1"
        ));
    }

    #[tokio::test]
    async fn write_to_vanished_agent_reports_cli_disconnected() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        dir.take_sent();
        dir.unreachable("a1");

        relay.handle_viewer("v1", write("t1", "ls\n"));
        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v1"),
            vec![ErrorCode::CliDisconnected]
        );
        assert!(relay.registry().get("t1").is_none());
    }

    #[tokio::test]
    async fn agent_events_from_unbound_agent_are_dropped() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        dir.agent("a2", "ns", "s1");
        relay.handle_viewer("v1", create("t1"));
        dir.take_sent();

        relay.handle_agent_event("a2", output("t1", "spoofed"));
        assert!(dir.take_sent().is_empty());

        relay.handle_agent_event("a1", output("t1", "hello"));
        let sent = dir.take_sent();
        assert!(matches!(
            &sent[..],
            [(to, Outbound::Event(TerminalEvent::Output(o)))] if to == "v1" && o.data == "hello"
        ));
    }

    #[tokio::test]
    async fn exit_event_removes_terminal() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        dir.take_sent();

        relay.handle_agent_event(
            "a1",
            TerminalEvent::Exit(termlink_common::protocol::TerminalExit {
                session_id: "s1".into(),
                terminal_id: "t1".into(),
                code: Some(0),
            }),
        );
        assert!(relay.registry().get("t1").is_none());
        assert_eq!(dir.take_sent().len(), 1);
    }

    // -------------------------------------------------------------------------
    // attach
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn reconnecting_viewer_reattaches_orphan() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer_disconnect("v1");
        dir.drop_socket("v1");
        dir.take_sent();

        dir.viewer("v2", "ns");
        relay.handle_viewer("v2", attach("t1"));
        let sent = dir.take_sent();
        assert!(matches!(
            &sent[..],
            [(to, Outbound::Event(TerminalEvent::Ready(r)))] if to == "v2" && r.terminal_id == "t1"
        ));

        // Output while attached reaches the new owner.
        relay.handle_agent_event("a1", output("t1", "x"));
        assert_eq!(dir.take_sent()[0].0, "v2");
    }

    #[tokio::test]
    async fn output_while_orphaned_is_dropped() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer_disconnect("v1");
        dir.take_sent();

        relay.handle_agent_event("a1", output("t1", "x"));
        assert!(dir.take_sent().is_empty());
    }

    #[tokio::test]
    async fn attach_after_agent_loss_is_cli_disconnected() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer_disconnect("v1");
        dir.drop_socket("a1");
        dir.take_sent();

        dir.viewer("v2", "ns");
        relay.handle_viewer("v2", attach("t1"));
        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v2"),
            vec![ErrorCode::CliDisconnected]
        );
        assert!(relay.registry().get("t1").is_none());

        // The reason outlives the entry.
        relay.handle_viewer("v2", attach("t1"));
        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v2"),
            vec![ErrorCode::CliDisconnected]
        );
    }

    #[tokio::test]
    async fn attach_across_namespaces_is_not_found() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer_disconnect("v1");
        dir.take_sent();

        dir.viewer("intruder", "other-ns");
        relay.handle_viewer("intruder", attach("t1"));
        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "intruder"),
            vec![ErrorCode::TerminalNotFound]
        );
        // Entry is untouched for its rightful owner.
        assert!(relay.registry().get("t1").unwrap().is_orphaned());
    }

    // -------------------------------------------------------------------------
    // close
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn owner_close_tells_agent_and_removes() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        dir.take_sent();

        relay.handle_viewer("v1", close("t1", None));
        let sent = dir.take_sent();
        assert!(matches!(
            &sent[..],
            [(to, Outbound::Request(AgentRequest::Close(c)))] if to == "a1" && c.terminal_id == "t1"
        ));
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn reconnect_fallback_close_requires_matching_session() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer_disconnect("v1");
        dir.take_sent();
        dir.viewer("v2", "ns");

        relay.handle_viewer("v2", close("t1", None));
        relay.handle_viewer("v2", close("t1", Some("wrong-session")));
        assert!(dir.take_sent().is_empty());
        assert!(relay.registry().get("t1").is_some());

        relay.handle_viewer("v2", close("t1", Some("s1")));
        let sent = dir.take_sent();
        assert!(matches!(
            &sent[..],
            [(to, Outbound::Request(AgentRequest::Close(_)))] if to == "a1"
        ));
        assert!(relay.registry().get("t1").is_none());
    }

    #[tokio::test]
    async fn fallback_close_from_other_namespace_is_ignored() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer_disconnect("v1");
        dir.take_sent();

        dir.viewer("intruder", "other-ns");
        relay.handle_viewer("intruder", close("t1", Some("s1")));
        assert!(dir.take_sent().is_empty());
        assert!(relay.registry().get("t1").is_some());
    }

    #[tokio::test]
    async fn close_of_attached_terminal_by_stranger_is_ignored() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        dir.take_sent();
        dir.viewer("v2", "ns");

        relay.handle_viewer("v2", close("t1", Some("s1")));
        assert!(dir.take_sent().is_empty());
        assert!(relay.registry().get("t1").is_some());
    }

    // -------------------------------------------------------------------------
    // disconnects and expiry
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn agent_disconnect_notifies_owners() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer("v1", create("t2"));
        dir.take_sent();

        dir.drop_socket("a1");
        relay.handle_agent_disconnect("a1");
        let sent = dir.take_sent();
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v1"),
            vec![ErrorCode::CliDisconnected, ErrorCode::CliDisconnected]
        );
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_expiry_closes_on_agent() {
        let (relay, dir) = setup(limits(4, 8), options(20, None));
        relay.handle_viewer("v1", create("t1"));
        relay.handle_viewer_disconnect("v1");
        dir.take_sent();

        tokio::time::sleep(Duration::from_millis(80)).await;
        let sent = dir.take_sent();
        assert!(matches!(
            &sent[..],
            [(to, Outbound::Request(AgentRequest::Close(_)))] if to == "a1"
        ));
        assert!(relay.registry().is_empty());
    }

    #[tokio::test]
    async fn idle_expiry_closes_and_tells_owner() {
        let (relay, dir) = setup(limits(4, 8), options(1_000, Some(30)));
        relay.handle_viewer("v1", create("t1"));
        dir.take_sent();

        tokio::time::sleep(Duration::from_millis(90)).await;
        let sent = dir.take_sent();
        assert!(sent
            .iter()
            .any(|(to, f)| to == "a1" && matches!(f, Outbound::Request(AgentRequest::Close(_)))));
        assert_eq!(
            FakeDirectory::errors_to(&sent, "v1"),
            vec![ErrorCode::TerminalNotFound]
        );
    }

    #[test]
    fn outbound_serializes_as_inner_frame() {
        let frame = Outbound::Event(TerminalEvent::ready("s1", "t1"));
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["event"], "terminal:ready");
        assert_eq!(value["data"]["terminalId"], "t1");
    }
}
