//! Presence and awareness
//!
//! [`Awareness`] holds per-client awareness states keyed by CRDT client id.
//! The session that creates it owns it and hands an `Arc` to collaborators.
//!
//! [`AwarenessController`] layers the network presence cache on top:
//!
//! ```text
//! local cursor/selection ──► Awareness ──(throttled)──┐
//!                                                     ├──► normalize ──► change event
//! presence envelope / roster / leave ──(immediate)────┘
//! ```

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// CRDT client id, as assigned by the Y.Doc
pub type ClientId = u64;

/// Default minimum spacing between awareness-originated change events
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(100);

/// Default age after which a remote presence entry is considered gone
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Identity shown to collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: String,
    pub user_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub color: String,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = presence_color(&user_id);
        Self {
            user_id,
            user_name: user_name.into(),
            email: None,
            color,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

/// Awareness state of one client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessState {
    pub user: UserIdentity,
    pub cursor: CursorPosition,
    pub selected_element: Option<String>,
}

impl AwarenessState {
    pub fn new(user: UserIdentity) -> Self {
        Self {
            user,
            cursor: CursorPosition::default(),
            selected_element: None,
        }
    }
}

/// Notification that a client's awareness state changed or was removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub client_id: ClientId,
    pub removed: bool,
}

/// Per-client awareness states for one document
pub struct Awareness {
    client_id: ClientId,
    states: RwLock<HashMap<ClientId, AwarenessState>>,
    updates: broadcast::Sender<AwarenessUpdate>,
}

impl Awareness {
    pub fn new(client_id: ClientId) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            client_id,
            states: RwLock::new(HashMap::new()),
            updates,
        }
    }

    /// Awareness bound to the local client of a Y.Doc
    pub fn for_doc(doc: &yrs::Doc) -> Self {
        Self::new(doc.client_id())
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.states.read().get(&self.client_id).cloned()
    }

    pub fn set_local_state(&self, state: AwarenessState) {
        self.apply_state(self.client_id, state);
    }

    /// Mutate the local state in place; no-op if no local state is set
    pub fn update_local_state<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut AwarenessState) -> bool,
    {
        let changed = {
            let mut states = self.states.write();
            match states.get_mut(&self.client_id) {
                Some(state) => f(state),
                None => false,
            }
        };
        if changed {
            self.notify(self.client_id, false);
        }
        changed
    }

    /// Set the state of any client (local or mirrored from a peer)
    pub fn apply_state(&self, client_id: ClientId, state: AwarenessState) {
        self.states.write().insert(client_id, state);
        self.notify(client_id, false);
    }

    pub fn remove_state(&self, client_id: ClientId) -> bool {
        let removed = self.states.write().remove(&client_id).is_some();
        if removed {
            self.notify(client_id, true);
        }
        removed
    }

    pub fn states(&self) -> HashMap<ClientId, AwarenessState> {
        self.states.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessUpdate> {
        self.updates.subscribe()
    }

    fn notify(&self, client_id: ClientId, removed: bool) {
        let _ = self.updates.send(AwarenessUpdate { client_id, removed });
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("states", &self.states.read().len())
            .finish()
    }
}

/// Presence as announced over the network by a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub cursor_x: f64,
    #[serde(default)]
    pub cursor_y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Cached presence of one remote user
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePresence {
    pub user_id: String,
    pub user_name: String,
    pub cursor_x: f64,
    pub cursor_y: f64,
    pub element_id: Option<String>,
    pub last_updated: Instant,
    pub meta: Option<serde_json::Value>,
}

impl RemotePresence {
    fn from_update(update: PresenceUpdate, now: Instant) -> Self {
        Self {
            user_id: update.user_id,
            user_name: update.user_name,
            cursor_x: update.cursor_x,
            cursor_y: update.cursor_y,
            element_id: update.element_id,
            last_updated: now,
            meta: update.meta,
        }
    }
}

/// Normalized view of everyone else on the page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceSnapshot {
    pub remote_users: BTreeMap<String, CursorPosition>,
    pub selected_by_user: BTreeMap<String, Option<String>>,
    pub users: BTreeMap<String, UserIdentity>,
}

impl PresenceSnapshot {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// Minimum spacing between awareness-originated change events
    pub throttle: Duration,
    /// Default age threshold for [`AwarenessController::prune_stale`]
    pub stale_after: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

#[derive(Default)]
struct Throttle {
    last_emit: Option<Instant>,
    trailing: Option<JoinHandle<()>>,
}

struct ControllerInner {
    awareness: Arc<Awareness>,
    user: UserIdentity,
    config: AwarenessConfig,
    remote: DashMap<String, RemotePresence>,
    snapshot: RwLock<PresenceSnapshot>,
    changes: broadcast::Sender<PresenceSnapshot>,
    throttle: Mutex<Throttle>,
}

/// Local presence propagation plus the remote presence cache
#[derive(Clone)]
pub struct AwarenessController {
    inner: Arc<ControllerInner>,
}

impl AwarenessController {
    /// Create a controller and seed the local awareness state
    pub fn new(awareness: Arc<Awareness>, user: UserIdentity, config: AwarenessConfig) -> Self {
        awareness.set_local_state(AwarenessState::new(user.clone()));
        let (changes, _) = broadcast::channel(256);

        Self {
            inner: Arc::new(ControllerInner {
                awareness,
                user,
                config,
                remote: DashMap::new(),
                snapshot: RwLock::new(PresenceSnapshot::default()),
                changes,
                throttle: Mutex::new(Throttle::default()),
            }),
        }
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.inner.awareness
    }

    pub fn user(&self) -> &UserIdentity {
        &self.inner.user
    }

    pub fn config(&self) -> &AwarenessConfig {
        &self.inner.config
    }

    /// Write the local cursor, even when unchanged
    pub fn update_local_cursor(&self, x: f64, y: f64) {
        self.inner.awareness.update_local_state(|state| {
            state.cursor = CursorPosition { x, y };
            true
        });
    }

    /// Write the local selection only if it differs. Returns whether it did.
    pub fn update_local_selection(&self, element_id: Option<String>) -> bool {
        self.inner.awareness.update_local_state(|state| {
            if state.selected_element == element_id {
                return false;
            }
            state.selected_element = element_id;
            true
        })
    }

    pub fn local_cursor(&self) -> CursorPosition {
        self.inner
            .awareness
            .local_state()
            .map(|s| s.cursor)
            .unwrap_or_default()
    }

    pub fn local_selection(&self) -> Option<String> {
        self.inner
            .awareness
            .local_state()
            .and_then(|s| s.selected_element)
    }

    /// Upsert a peer's presence. Self-echoes are ignored.
    pub fn handle_remote_presence(&self, update: PresenceUpdate) -> bool {
        if update.user_id == self.inner.user.user_id || update.user_id.is_empty() {
            return false;
        }
        let entry = RemotePresence::from_update(update, Instant::now());
        self.inner.remote.insert(entry.user_id.clone(), entry);
        self.emit();
        true
    }

    /// Replace the whole remote cache with a server roster
    pub fn handle_sync_users(&self, users: Vec<PresenceUpdate>) {
        let now = Instant::now();
        self.inner.remote.clear();
        for update in users {
            if update.user_id == self.inner.user.user_id || update.user_id.is_empty() {
                continue;
            }
            let entry = RemotePresence::from_update(update, now);
            self.inner.remote.insert(entry.user_id.clone(), entry);
        }
        debug!(users = self.inner.remote.len(), "Presence roster replaced");
        self.emit();
    }

    /// Drop a user on explicit leave
    pub fn remove_user(&self, user_id: &str) -> bool {
        let removed = self.inner.remote.remove(user_id).is_some();
        if removed {
            self.emit();
        }
        removed
    }

    /// Drop entries older than `max_age`. Emits only if something was removed.
    pub fn prune_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.inner.remote.len();
        self.inner
            .remote
            .retain(|_, p| now.duration_since(p.last_updated) <= max_age);
        let removed = before.saturating_sub(self.inner.remote.len());

        if removed > 0 {
            debug!(removed, "Pruned stale presence");
            self.emit();
        }
        removed
    }

    pub fn remote_presence(&self, user_id: &str) -> Option<RemotePresence> {
        self.inner.remote.get(user_id).map(|r| r.value().clone())
    }

    pub fn remote_count(&self) -> usize {
        self.inner.remote.len()
    }

    /// Last emitted snapshot
    pub fn snapshot(&self) -> PresenceSnapshot {
        self.inner.snapshot.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceSnapshot> {
        self.inner.changes.subscribe()
    }

    /// React to an awareness state change, at most once per throttle window.
    /// A change inside the window schedules one trailing emission.
    pub fn on_awareness_change(&self) {
        let now = Instant::now();
        let mut throttle = self.inner.throttle.lock();

        if let Some(last) = throttle.last_emit {
            let elapsed = now.duration_since(last);
            if elapsed < self.inner.config.throttle {
                if throttle.trailing.is_none() {
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        let wait = self.inner.config.throttle - elapsed;
                        let this = self.clone();
                        throttle.trailing = Some(handle.spawn(async move {
                            tokio::time::sleep(wait).await;
                            {
                                let mut throttle = this.inner.throttle.lock();
                                throttle.trailing = None;
                                throttle.last_emit = Some(Instant::now());
                            }
                            this.emit();
                        }));
                    }
                }
                return;
            }
        }

        throttle.last_emit = Some(now);
        drop(throttle);
        self.emit();
    }

    /// Forward awareness updates into [`Self::on_awareness_change`]
    pub fn spawn_awareness_listener(&self) -> JoinHandle<()> {
        let mut rx = self.inner.awareness.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => this.on_awareness_change(),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Clear the remote cache, cancel pending emissions and withdraw the local state
    pub fn destroy(&self) {
        if let Some(trailing) = self.inner.throttle.lock().trailing.take() {
            trailing.abort();
        }
        self.inner.remote.clear();
        *self.inner.snapshot.write() = PresenceSnapshot::default();
        self.inner
            .awareness
            .remove_state(self.inner.awareness.client_id());
    }

    fn emit(&self) {
        let snapshot = self.normalize();
        *self.inner.snapshot.write() = snapshot.clone();
        let _ = self.inner.changes.send(snapshot);
    }

    /// Merge the remote cache with awareness states it does not already cover
    fn normalize(&self) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::default();

        for entry in self.inner.remote.iter() {
            let p = entry.value();
            snapshot.remote_users.insert(
                p.user_id.clone(),
                CursorPosition {
                    x: p.cursor_x,
                    y: p.cursor_y,
                },
            );
            snapshot
                .selected_by_user
                .insert(p.user_id.clone(), p.element_id.clone());
            let mut identity = UserIdentity::new(p.user_id.clone(), p.user_name.clone());
            if let Some(email) = p
                .meta
                .as_ref()
                .and_then(|m| m.get("email"))
                .and_then(|e| e.as_str())
            {
                identity.email = Some(email.to_string());
            }
            snapshot.users.insert(p.user_id.clone(), identity);
        }

        let local_client = self.inner.awareness.client_id();
        for (client_id, state) in self.inner.awareness.states() {
            let user_id = &state.user.user_id;
            if client_id == local_client
                || *user_id == self.inner.user.user_id
                || snapshot.users.contains_key(user_id)
            {
                continue;
            }
            snapshot.remote_users.insert(user_id.clone(), state.cursor);
            snapshot
                .selected_by_user
                .insert(user_id.clone(), state.selected_element.clone());
            snapshot.users.insert(user_id.clone(), state.user.clone());
        }

        snapshot
    }
}

impl std::fmt::Debug for AwarenessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwarenessController")
            .field("user", &self.inner.user.user_id)
            .field("remote", &self.inner.remote.len())
            .finish()
    }
}

/// Deterministic cursor colour for a user id
pub fn presence_color(user_id: &str) -> String {
    let hash = user_id.chars().fold(0i32, |hash, c| {
        (c as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash))
    });
    format!("hsl({}, 70%, 50%)", hash.unsigned_abs() % 360)
}
