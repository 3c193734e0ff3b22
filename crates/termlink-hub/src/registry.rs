//! Terminal registry: which viewer owns which terminal, which agent hosts
//! it, and when orphaned or idle terminals expire.
//!
//! All state sits behind one mutex so the three indices (owner, session,
//! agent) never disagree. Timers are `ScheduledTask`s owned by the slot they
//! affect and carry a token; a firing whose token is no longer current does
//! nothing. Expiry callbacks run after the lock is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use termlink_common::{next_token, ErrorCode, ScheduledTask};
use termlink_config::HubConfig;

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Why a terminal left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Keep-alive or idle timer ran out.
    Expired,
    /// The agent socket hosting the terminal went away.
    CliDisconnected,
}

impl RemovalReason {
    /// Code reported to a viewer that tries to attach afterwards.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Expired => ErrorCode::TerminalNotFound,
            Self::CliDisconnected => ErrorCode::CliDisconnected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRegistryEntry {
    pub terminal_id: String,
    pub session_id: String,
    /// `None` while orphaned.
    pub owner_socket_id: Option<String>,
    pub agent_socket_id: String,
    pub orphaned_at: Option<Instant>,
    pub removed_reason: Option<RemovalReason>,
}

impl TerminalRegistryEntry {
    pub fn is_orphaned(&self) -> bool {
        self.orphaned_at.is_some()
    }

    pub fn is_owned_by(&self, socket_id: &str) -> bool {
        self.owner_socket_id.as_deref() == Some(socket_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Grace period for orphaned terminals. Zero removes them at once.
    pub keep_alive: Duration,
    /// Inactivity limit for attached terminals. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// How long a removal reason is remembered for late attaches.
    pub removal_reason_ttl: Duration,
}

impl From<&HubConfig> for RegistryOptions {
    fn from(config: &HubConfig) -> Self {
        Self {
            keep_alive: config.keep_alive(),
            idle_timeout: config.idle_timeout(),
            removal_reason_ttl: config.removal_reason_ttl(),
        }
    }
}

pub type RegistryCallback = Box<dyn Fn(TerminalRegistryEntry) + Send + Sync>;

#[derive(Default)]
pub struct RegistryCallbacks {
    /// A keep-alive ran out on an orphaned terminal.
    pub on_expired: Option<RegistryCallback>,
    /// An attached terminal saw no activity for the idle timeout.
    pub on_idle: Option<RegistryCallback>,
}

// =============================================================================
// INTERNAL STATE
// =============================================================================

struct Slot {
    entry: TerminalRegistryEntry,
    keep_alive: Option<ScheduledTask>,
    keep_alive_token: u64,
    idle: Option<ScheduledTask>,
    idle_token: u64,
}

struct ReasonRecord {
    reason: RemovalReason,
    token: u64,
    _expiry: ScheduledTask,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    by_owner: HashMap<String, HashSet<String>>,
    by_session: HashMap<String, HashSet<String>>,
    by_agent: HashMap<String, HashSet<String>>,
    removal_reasons: HashMap<String, ReasonRecord>,
}

fn index(map: &mut HashMap<String, HashSet<String>>, key: &str, terminal_id: &str) {
    map.entry(key.to_string())
        .or_default()
        .insert(terminal_id.to_string());
}

fn unindex(map: &mut HashMap<String, HashSet<String>>, key: &str, terminal_id: &str) {
    if let Some(ids) = map.get_mut(key) {
        ids.remove(terminal_id);
        if ids.is_empty() {
            map.remove(key);
        }
    }
}

impl Inner {
    /// Drop a slot and every index pointing at it. Its timers go with it.
    fn take(&mut self, terminal_id: &str) -> Option<TerminalRegistryEntry> {
        let slot = self.slots.remove(terminal_id)?;
        let entry = slot.entry;
        if let Some(owner) = &entry.owner_socket_id {
            unindex(&mut self.by_owner, owner, terminal_id);
        }
        unindex(&mut self.by_session, &entry.session_id, terminal_id);
        unindex(&mut self.by_agent, &entry.agent_socket_id, terminal_id);
        Some(entry)
    }
}

struct Shared {
    options: RegistryOptions,
    callbacks: RegistryCallbacks,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_idle(self: &Arc<Self>, inner: &mut Inner, terminal_id: &str) {
        let Some(timeout) = self.options.idle_timeout else {
            return;
        };
        let Some(slot) = inner.slots.get_mut(terminal_id) else {
            return;
        };
        let token = next_token();
        let weak = Arc::downgrade(self);
        let id = terminal_id.to_string();
        slot.idle_token = token;
        slot.idle = Some(ScheduledTask::after(timeout, async move {
            if let Some(shared) = weak.upgrade() {
                shared.fire_idle(&id, token);
            }
        }));
    }

    fn arm_keep_alive(self: &Arc<Self>, slot: &mut Slot) {
        let token = next_token();
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = slot.entry.terminal_id.clone();
        slot.keep_alive_token = token;
        slot.keep_alive = Some(ScheduledTask::after(self.options.keep_alive, async move {
            if let Some(shared) = weak.upgrade() {
                shared.fire_keep_alive(&id, token);
            }
        }));
    }

    fn record_reason(self: &Arc<Self>, inner: &mut Inner, terminal_id: &str, reason: RemovalReason) {
        let token = next_token();
        let weak = Arc::downgrade(self);
        let id = terminal_id.to_string();
        let expiry = ScheduledTask::after(self.options.removal_reason_ttl, async move {
            if let Some(shared) = weak.upgrade() {
                let mut inner = shared.lock();
                if inner.removal_reasons.get(&id).is_some_and(|r| r.token == token) {
                    inner.removal_reasons.remove(&id);
                }
            }
        });
        inner.removal_reasons.insert(
            terminal_id.to_string(),
            ReasonRecord {
                reason,
                token,
                _expiry: expiry,
            },
        );
    }

    /// Remove an entry, remembering why.
    fn remove_with_reason(
        self: &Arc<Self>,
        inner: &mut Inner,
        terminal_id: &str,
        reason: RemovalReason,
    ) -> Option<TerminalRegistryEntry> {
        let mut entry = inner.take(terminal_id)?;
        entry.removed_reason = Some(reason);
        self.record_reason(inner, terminal_id, reason);
        Some(entry)
    }

    fn fire_keep_alive(self: &Arc<Self>, terminal_id: &str, token: u64) {
        let expired = {
            let mut inner = self.lock();
            let current = inner
                .slots
                .get(terminal_id)
                .is_some_and(|slot| slot.entry.is_orphaned() && slot.keep_alive_token == token);
            if !current {
                return;
            }
            self.remove_with_reason(&mut inner, terminal_id, RemovalReason::Expired)
        };

        if let Some(entry) = expired {
            tracing::info!(terminal_id = %entry.terminal_id, "Orphaned terminal expired");
            if let Some(callback) = &self.callbacks.on_expired {
                callback(entry);
            }
        }
    }

    fn fire_idle(self: &Arc<Self>, terminal_id: &str, token: u64) {
        let expired = {
            let mut inner = self.lock();
            let current = inner
                .slots
                .get(terminal_id)
                .is_some_and(|slot| !slot.entry.is_orphaned() && slot.idle_token == token);
            if !current {
                return;
            }
            self.remove_with_reason(&mut inner, terminal_id, RemovalReason::Expired)
        };

        if let Some(entry) = expired {
            tracing::info!(terminal_id = %entry.terminal_id, "Idle terminal expired");
            if let Some(callback) = &self.callbacks.on_idle {
                callback(entry);
            }
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

pub struct TerminalRegistry {
    shared: Arc<Shared>,
}

impl TerminalRegistry {
    pub fn new(options: RegistryOptions, callbacks: RegistryCallbacks) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                callbacks,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Add a terminal. Returns `None` if the id is already registered.
    pub fn register(
        &self,
        terminal_id: &str,
        session_id: &str,
        owner_socket_id: &str,
        agent_socket_id: &str,
    ) -> Option<TerminalRegistryEntry> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if inner.slots.contains_key(terminal_id) {
            return None;
        }

        let entry = TerminalRegistryEntry {
            terminal_id: terminal_id.to_string(),
            session_id: session_id.to_string(),
            owner_socket_id: Some(owner_socket_id.to_string()),
            agent_socket_id: agent_socket_id.to_string(),
            orphaned_at: None,
            removed_reason: None,
        };
        inner.slots.insert(
            terminal_id.to_string(),
            Slot {
                entry: entry.clone(),
                keep_alive: None,
                keep_alive_token: 0,
                idle: None,
                idle_token: 0,
            },
        );
        index(&mut inner.by_owner, owner_socket_id, terminal_id);
        index(&mut inner.by_session, session_id, terminal_id);
        index(&mut inner.by_agent, agent_socket_id, terminal_id);
        inner.removal_reasons.remove(terminal_id);
        self.shared.arm_idle(inner, terminal_id);

        Some(entry)
    }

    pub fn get(&self, terminal_id: &str) -> Option<TerminalRegistryEntry> {
        self.shared.lock().slots.get(terminal_id).map(|slot| slot.entry.clone())
    }

    /// Restart the idle timer of an attached terminal.
    pub fn mark_activity(&self, terminal_id: &str) {
        let mut inner = self.shared.lock();
        let attached = inner
            .slots
            .get(terminal_id)
            .is_some_and(|slot| !slot.entry.is_orphaned());
        if attached {
            self.shared.arm_idle(&mut inner, terminal_id);
        }
    }

    pub fn remove(&self, terminal_id: &str) -> Option<TerminalRegistryEntry> {
        self.shared.lock().take(terminal_id)
    }

    /// Remove a terminal and remember why, so a later attach can report it.
    pub fn remove_with_reason(
        &self,
        terminal_id: &str,
        reason: RemovalReason,
    ) -> Option<TerminalRegistryEntry> {
        let mut inner = self.shared.lock();
        self.shared.remove_with_reason(&mut inner, terminal_id, reason)
    }

    /// Detach every terminal owned by a departed viewer socket and start
    /// their keep-alive timers.
    pub fn orphan_by_socket(&self, owner_socket_id: &str) -> Vec<TerminalRegistryEntry> {
        let (orphaned, expired) = {
            let mut guard = self.shared.lock();
            let inner = &mut *guard;
            let ids = inner.by_owner.remove(owner_socket_id).unwrap_or_default();
            let now = Instant::now();
            let mut orphaned = Vec::new();
            let mut expired = Vec::new();

            for terminal_id in ids {
                let Some(slot) = inner.slots.get_mut(&terminal_id) else {
                    continue;
                };
                slot.entry.owner_socket_id = None;
                slot.entry.orphaned_at = Some(now);
                slot.idle = None;

                if self.shared.options.keep_alive.is_zero() {
                    if let Some(entry) =
                        self.shared
                            .remove_with_reason(inner, &terminal_id, RemovalReason::Expired)
                    {
                        orphaned.push(entry.clone());
                        expired.push(entry);
                    }
                } else {
                    self.shared.arm_keep_alive(slot);
                    orphaned.push(slot.entry.clone());
                }
            }
            (orphaned, expired)
        };

        if !orphaned.is_empty() {
            tracing::info!(
                socket_id = %owner_socket_id,
                count = orphaned.len(),
                "Orphaned terminals of departed viewer"
            );
        }
        if let Some(callback) = &self.shared.callbacks.on_expired {
            for entry in expired {
                callback(entry);
            }
        }
        orphaned
    }

    /// Drop every terminal hosted by a departed agent socket.
    pub fn remove_by_cli_disconnect(&self, agent_socket_id: &str) -> Vec<TerminalRegistryEntry> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let ids = inner.by_agent.get(agent_socket_id).cloned().unwrap_or_default();
        ids.iter()
            .filter_map(|terminal_id| {
                self.shared
                    .remove_with_reason(inner, terminal_id, RemovalReason::CliDisconnected)
            })
            .collect()
    }

    /// Bind an orphaned terminal to a new viewer socket.
    ///
    /// A socket that already owns the terminal gets it back unchanged. A
    /// terminal that was removed because its agent left reports
    /// `cli_disconnected`; anything else missing is `terminal_not_found`.
    pub fn attach_to_socket(
        &self,
        terminal_id: &str,
        session_id: &str,
        new_owner_socket_id: &str,
    ) -> Result<TerminalRegistryEntry, ErrorCode> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;

        let Some(slot) = inner.slots.get_mut(terminal_id) else {
            return Err(inner
                .removal_reasons
                .get(terminal_id)
                .map(|record| record.reason.error_code())
                .unwrap_or(ErrorCode::TerminalNotFound));
        };
        if slot.entry.session_id != session_id {
            return Err(ErrorCode::TerminalNotFound);
        }
        if !slot.entry.is_orphaned() {
            return if slot.entry.is_owned_by(new_owner_socket_id) {
                Ok(slot.entry.clone())
            } else {
                Err(ErrorCode::TerminalNotFound)
            };
        }

        slot.keep_alive = None;
        slot.entry.owner_socket_id = Some(new_owner_socket_id.to_string());
        slot.entry.orphaned_at = None;
        let entry = slot.entry.clone();

        index(&mut inner.by_owner, new_owner_socket_id, terminal_id);
        inner.removal_reasons.remove(terminal_id);
        self.shared.arm_idle(inner, terminal_id);

        Ok(entry)
    }

    /// Terminals owned by a viewer socket.
    pub fn count_for_socket(&self, owner_socket_id: &str) -> usize {
        self.shared
            .lock()
            .by_owner
            .get(owner_socket_id)
            .map_or(0, HashSet::len)
    }

    /// Terminals registered under a session, orphaned ones included.
    pub fn count_for_session(&self, session_id: &str) -> usize {
        self.shared
            .lock()
            .by_session
            .get(session_id)
            .map_or(0, HashSet::len)
    }

    /// Why a terminal was removed, if that is still remembered.
    pub fn removal_reason(&self, terminal_id: &str) -> Option<RemovalReason> {
        self.shared
            .lock()
            .removal_reasons
            .get(terminal_id)
            .map(|record| record.reason)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn options(keep_alive_ms: u64) -> RegistryOptions {
        RegistryOptions {
            keep_alive: Duration::from_millis(keep_alive_ms),
            idle_timeout: None,
            removal_reason_ttl: Duration::from_secs(60),
        }
    }

    fn registry(keep_alive_ms: u64) -> TerminalRegistry {
        TerminalRegistry::new(options(keep_alive_ms), RegistryCallbacks::default())
    }

    /// Registry whose callbacks record (kind, terminal id).
    fn recording(options: RegistryOptions) -> (TerminalRegistry, Arc<Mutex<Vec<(String, String)>>>) {
        let log: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let expired_log = Arc::clone(&log);
        let idle_log = Arc::clone(&log);
        let registry = TerminalRegistry::new(
            options,
            RegistryCallbacks {
                on_expired: Some(Box::new(move |entry| {
                    expired_log
                        .lock()
                        .unwrap()
                        .push(("expired".into(), entry.terminal_id));
                })),
                on_idle: Some(Box::new(move |entry| {
                    idle_log.lock().unwrap().push(("idle".into(), entry.terminal_id));
                })),
            },
        );
        (registry, log)
    }

    #[tokio::test]
    async fn register_rejects_duplicate_ids() {
        let registry = registry(1_000);
        assert!(registry.register("t1", "s1", "v1", "a1").is_some());
        assert!(registry.register("t1", "s2", "v2", "a2").is_none());

        let entry = registry.get("t1").unwrap();
        assert_eq!(entry.session_id, "s1");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.count_for_socket("v1"), 1);
        assert_eq!(registry.count_for_socket("v2"), 0);
    }

    #[tokio::test]
    async fn counts_track_sockets_and_sessions() {
        let registry = registry(1_000);
        registry.register("t1", "s1", "v1", "a1");
        registry.register("t2", "s1", "v2", "a1");
        registry.register("t3", "s2", "v1", "a2");

        assert_eq!(registry.count_for_socket("v1"), 2);
        assert_eq!(registry.count_for_session("s1"), 2);

        registry.remove("t1");
        assert_eq!(registry.count_for_socket("v1"), 1);
        assert_eq!(registry.count_for_session("s1"), 1);
        assert!(registry.remove("t1").is_none());
    }

    #[tokio::test]
    async fn orphaned_terminal_survives_grace_and_reattaches() {
        let (registry, log) = recording(options(100));
        registry.register("t1", "s1", "v1", "a1");

        let orphaned = registry.orphan_by_socket("v1");
        assert_eq!(orphaned.len(), 1);
        assert!(orphaned[0].is_orphaned());
        assert_eq!(orphaned[0].owner_socket_id, None);
        assert_eq!(registry.count_for_socket("v1"), 0);
        assert_eq!(registry.count_for_session("s1"), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let entry = registry.attach_to_socket("t1", "s1", "v2").unwrap();
        assert_eq!(entry.owner_socket_id.as_deref(), Some("v2"));
        assert!(!entry.is_orphaned());
        assert_eq!(registry.count_for_socket("v2"), 1);

        // The cancelled keep-alive must not fire later.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get("t1").is_some());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn keep_alive_expiry_removes_and_notifies() {
        let (registry, log) = recording(options(20));
        registry.register("t1", "s1", "v1", "a1");
        registry.orphan_by_socket("v1");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.get("t1").is_none());
        assert_eq!(registry.removal_reason("t1"), Some(RemovalReason::Expired));
        assert_eq!(
            *log.lock().unwrap(),
            vec![("expired".to_string(), "t1".to_string())]
        );
        assert_eq!(
            registry.attach_to_socket("t1", "s1", "v2"),
            Err(ErrorCode::TerminalNotFound)
        );
    }

    #[tokio::test]
    async fn zero_keep_alive_removes_immediately() {
        let (registry, log) = recording(options(0));
        registry.register("t1", "s1", "v1", "a1");

        let orphaned = registry.orphan_by_socket("v1");
        assert_eq!(orphaned[0].removed_reason, Some(RemovalReason::Expired));
        assert!(registry.is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cli_disconnect_takes_precedence_on_attach() {
        let registry = registry(1_000);
        registry.register("t1", "s1", "v1", "a1");
        registry.register("t2", "s1", "v1", "a2");
        registry.orphan_by_socket("v1");

        let removed = registry.remove_by_cli_disconnect("a1");
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].terminal_id, "t1");
        assert_eq!(removed[0].removed_reason, Some(RemovalReason::CliDisconnected));

        assert_eq!(
            registry.attach_to_socket("t1", "s1", "v2"),
            Err(ErrorCode::CliDisconnected)
        );
        assert!(registry.attach_to_socket("t2", "s1", "v2").is_ok());
    }

    #[tokio::test]
    async fn removal_reason_is_forgotten_after_ttl() {
        let registry = TerminalRegistry::new(
            RegistryOptions {
                removal_reason_ttl: Duration::from_millis(20),
                ..options(1_000)
            },
            RegistryCallbacks::default(),
        );
        registry.register("t1", "s1", "v1", "a1");
        registry.remove_by_cli_disconnect("a1");
        assert_eq!(registry.removal_reason("t1"), Some(RemovalReason::CliDisconnected));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.removal_reason("t1"), None);
        assert_eq!(
            registry.attach_to_socket("t1", "s1", "v2"),
            Err(ErrorCode::TerminalNotFound)
        );
    }

    #[tokio::test]
    async fn attach_requires_orphan_and_matching_session() {
        let registry = registry(1_000);
        registry.register("t1", "s1", "v1", "a1");

        // Attached to someone else.
        assert_eq!(
            registry.attach_to_socket("t1", "s1", "v2"),
            Err(ErrorCode::TerminalNotFound)
        );
        // Current owner re-attaching is a no-op success.
        assert!(registry.attach_to_socket("t1", "s1", "v1").is_ok());

        registry.orphan_by_socket("v1");
        assert_eq!(
            registry.attach_to_socket("t1", "other-session", "v2"),
            Err(ErrorCode::TerminalNotFound)
        );
        assert_eq!(
            registry.attach_to_socket("missing", "s1", "v2"),
            Err(ErrorCode::TerminalNotFound)
        );
    }

    #[tokio::test]
    async fn idle_timer_fires_and_activity_defers_it() {
        let (registry, log) = recording(RegistryOptions {
            idle_timeout: Some(Duration::from_millis(60)),
            ..options(1_000)
        });
        registry.register("busy", "s1", "v1", "a1");
        registry.register("quiet", "s1", "v1", "a1");

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            registry.mark_activity("busy");
        }

        assert!(registry.get("busy").is_some());
        assert!(registry.get("quiet").is_none());
        assert_eq!(registry.removal_reason("quiet"), Some(RemovalReason::Expired));
        assert_eq!(
            *log.lock().unwrap(),
            vec![("idle".to_string(), "quiet".to_string())]
        );
    }

    #[tokio::test]
    async fn orphaned_terminals_have_no_idle_timer() {
        let (registry, log) = recording(RegistryOptions {
            idle_timeout: Some(Duration::from_millis(20)),
            ..options(1_000)
        });
        registry.register("t1", "s1", "v1", "a1");
        registry.orphan_by_socket("v1");
        registry.mark_activity("t1");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.get("t1").is_some());
        assert!(log.lock().unwrap().is_empty());
    }
}
