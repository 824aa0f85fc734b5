//! Session coordinator: the single entry point for every client request.
//!
//! Validates the caller against the registry, enforces the admin-only
//! gates, mutates the action log and hands events to the broadcast engine.
//!
//! Session state machine:
//! ```text
//! EMPTY ──register(admin)──► ACTIVE
//! ACTIVE ──admin leaves────► EMPTY     (everyone kicked, log cleared)
//! ACTIVE: register(user) ──► WAITING ──accept──► REGISTERED
//!                                    └─refuse──► removed
//! ```
//!
//! Locking: the action log and the registry have separate locks and are
//! always taken in that order (log, then registry). Actions are appended
//! and published while the log write lock is held, so log order equals
//! publish order. Waiting-list joins and non-admin departures only take
//! the registry. Nothing is delivered while the registry lock is held;
//! the engine only enqueues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::action::Action;
use crate::action_log::{ActionLog, CanvasBlob};
use crate::broadcast::{BroadcastConfig, BroadcastEngine, BroadcastStats};
use crate::error::SessionResult;
use crate::handle::{ClientEvent, ClientHandle};
use crate::registry::{Departure, SessionRegistry};

/// Sender name used for server-generated chat lines.
pub const SYSTEM_SENDER: &str = "System";

const ADMIN_LEFT_REASON: &str = "Admin left, whiteboard will close";
const REFUSED_REASON: &str = "Admin refused your request to join";

/// All mutable session state, owned by the server process.
#[derive(Default)]
pub struct SessionState {
    registry: Mutex<SessionRegistry>,
    log: RwLock<ActionLog>,
    canvas_closed: AtomicBool,
    next_action_id: AtomicU64,
}

pub struct SessionCoordinator {
    state: SessionState,
    engine: BroadcastEngine,
}

impl SessionCoordinator {
    /// Must be called from within a tokio runtime.
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            state: SessionState::default(),
            engine: BroadcastEngine::new(config),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Register a client.
    ///
    /// An admin handle creates the session; any other handle joins the
    /// waiting list and the admin is asked for approval.
    pub async fn register_client(&self, handle: ClientHandle) -> SessionResult<()> {
        let username = handle.username().to_string();

        if !handle.is_admin() {
            let admin = self.state.registry.lock().await.request_join(handle)?;
            self.engine.send_to(&admin, ClientEvent::AskUserJoin(username.clone()));
            log::info!("'{username}' is waiting for approval from '{}'", admin.username());
            return Ok(());
        }

        let log = self.state.log.read().await;
        let mut registry = self.state.registry.lock().await;
        let blob = log.snapshot()?;
        registry.register_admin(handle.clone())?;
        let usernames = registry.usernames();
        drop(registry);

        self.state.canvas_closed.store(false, Ordering::Release);
        self.engine.send_to(
            &handle,
            ClientEvent::InitialClientState {
                usernames,
                is_admin: true,
            },
        );
        self.engine.send_to(&handle, ClientEvent::SyncWhiteboard(blob));
        log::info!("Admin '{username}' created a new whiteboard");
        Ok(())
    }

    /// Admin approves a waiting user: the joiner gets the current canvas and
    /// every member (joiner included) is told about the add.
    pub async fn accept_user_join(&self, requester: &str, username: &str) -> SessionResult<()> {
        // Held until the joiner's snapshot is queued so no action slips between.
        let log = self.state.log.read().await;
        let mut registry = self.state.registry.lock().await;
        registry.ensure_admin(requester)?;
        let blob = log.snapshot()?;
        let joiner = registry.approve_join(username)?;
        let usernames = registry.usernames();
        let members = registry.registered_handles();
        drop(registry);

        self.engine.send_to(
            &joiner,
            ClientEvent::InitialClientState {
                usernames,
                is_admin: false,
            },
        );
        self.engine.send_to(&joiner, ClientEvent::SyncWhiteboard(blob));
        if self.is_canvas_closed() {
            self.engine.send_to(&joiner, ClientEvent::CanvasBlocked(true));
        }
        self.engine
            .publish(&members, None, ClientEvent::AddUser(username.to_string()));
        drop(log);

        log::info!("'{username}' joined the whiteboard");
        Ok(())
    }

    /// Admin refuses a waiting user, who receives a kick-style notice.
    pub async fn refuse_user_join(&self, requester: &str, username: &str) -> SessionResult<()> {
        let refused = {
            let mut registry = self.state.registry.lock().await;
            registry.ensure_admin(requester)?;
            registry.refuse_join(username)?
        };
        self.engine.send_to(
            &refused,
            ClientEvent::Kicked {
                reason: REFUSED_REASON.to_string(),
            },
        );
        self.engine.retire(&refused);
        log::info!("Admin refused join request from '{username}'");
        Ok(())
    }

    /// Remove a user. The admin leaving closes the whiteboard.
    pub async fn unregister_client(&self, username: &str) -> SessionResult<()> {
        self.depart(username, None).await.map(|_| ())
    }

    /// Connection `connection_id` of `username` went away.
    ///
    /// No-op if the user already left or has since reconnected.
    pub async fn disconnect(&self, username: &str, connection_id: Uuid) {
        match self.depart(username, Some(connection_id)).await {
            Ok(true) => log::info!("Connection of '{username}' closed"),
            Ok(false) => {}
            Err(e) => log::debug!("Disconnect of '{username}' ignored: {e}"),
        }
    }

    /// Remove `username`, bound to `connection_id` when given.
    ///
    /// Only an admin departure takes the log lock, since it clears the canvas.
    /// Returns whether anyone was removed.
    async fn depart(&self, username: &str, connection_id: Option<Uuid>) -> SessionResult<bool> {
        let mut registry = self.state.registry.lock().await;
        if !registry.is_admin(username) {
            let Some(departure) = take_departure(&mut registry, username, connection_id)? else {
                return Ok(false);
            };
            let members = registry.registered_handles();
            drop(registry);
            self.finish_departure(departure, &members);
            return Ok(true);
        }
        drop(registry);

        let mut log = self.state.log.write().await;
        let mut registry = self.state.registry.lock().await;
        let Some(departure) = take_departure(&mut registry, username, connection_id)? else {
            return Ok(false);
        };
        let members = registry.registered_handles();
        drop(registry);

        if let Departure::Admin { .. } = departure {
            log.clear();
        }
        drop(log);
        self.finish_departure(departure, &members);
        Ok(true)
    }

    fn finish_departure(&self, departure: Departure, members: &[ClientHandle]) {
        match departure {
            Departure::Member(handle) => {
                self.engine.retire(&handle);
                self.engine
                    .publish(members, None, ClientEvent::RemoveUser(handle.username().to_string()));
                log::info!("'{}' left the whiteboard", handle.username());
            }
            Departure::Waiting(handle) => {
                self.engine.retire(&handle);
                log::info!("'{}' withdrew their join request", handle.username());
            }
            Departure::Admin { admin, evicted } => {
                self.state.canvas_closed.store(false, Ordering::Release);
                self.engine.retire(&admin);
                // Queued per client, so a dead client never stalls the rest.
                for handle in &evicted {
                    self.engine.send_to(
                        handle,
                        ClientEvent::Kicked {
                            reason: ADMIN_LEFT_REASON.to_string(),
                        },
                    );
                    self.engine.retire(handle);
                }
                log::info!(
                    "Admin '{}' left; closed whiteboard and kicked {} user(s)",
                    admin.username(),
                    evicted.len()
                );
            }
        }
    }

    /// Admin removes `target` from the session.
    pub async fn kick_user(&self, requester: &str, target: &str, reason: &str) -> SessionResult<()> {
        let (departure, members) = {
            let mut registry = self.state.registry.lock().await;
            let departure = registry.kick(requester, target)?;
            (departure, registry.registered_handles())
        };

        let (handle, was_member) = match &departure {
            Departure::Member(handle) => (handle, true),
            Departure::Waiting(handle) => (handle, false),
            Departure::Admin { admin, .. } => (admin, false),
        };
        self.engine.send_to(
            handle,
            ClientEvent::Kicked {
                reason: reason.to_string(),
            },
        );
        self.engine.retire(handle);

        if was_member {
            self.engine
                .publish(&members, None, ClientEvent::RemoveUser(target.to_string()));
            self.engine.publish(
                &members,
                None,
                ClientEvent::Message {
                    sender: SYSTEM_SENDER.to_string(),
                    text: format!("'{target}' was kicked by the admin"),
                },
            );
        }
        log::info!("Admin '{requester}' kicked '{target}': {reason}");
        Ok(())
    }

    /// Append an action to the log and relay it to everyone but its author.
    ///
    /// The author is forced to `username` and the server assigns the id,
    /// which is returned.
    pub async fn broadcast_action(&self, username: &str, mut action: Action) -> SessionResult<u64> {
        let mut log = self.state.log.write().await;
        let members = {
            let registry = self.state.registry.lock().await;
            registry.ensure_registered(username)?;
            registry.registered_handles()
        };

        action.id = self.state.next_action_id.fetch_add(1, Ordering::Relaxed) + 1;
        action.author = username.to_string();
        let id = action.id;
        log::debug!("Action #{id} ({}) from '{username}'", action.kind.name());

        log.append(action.clone());
        self.engine
            .publish(&members, Some(username), ClientEvent::Action(action));
        Ok(id)
    }

    /// Relay a chat line to everyone but its sender. Not persisted.
    pub async fn broadcast_message(&self, username: &str, text: &str) -> SessionResult<()> {
        let members = {
            let registry = self.state.registry.lock().await;
            registry.ensure_registered(username)?;
            registry.registered_handles()
        };
        self.engine.publish(
            &members,
            Some(username),
            ClientEvent::Message {
                sender: username.to_string(),
                text: text.to_string(),
            },
        );
        Ok(())
    }

    /// Admin clears the canvas. `is_close` also blocks drawing on every
    /// client until a new canvas is opened or imported.
    pub async fn clear_canvas(&self, requester: &str, is_close: bool) -> SessionResult<()> {
        let mut log = self.state.log.write().await;
        let members = {
            let registry = self.state.registry.lock().await;
            registry.ensure_admin(requester)?;
            registry.registered_handles()
        };

        log.clear();
        self.state.canvas_closed.store(is_close, Ordering::Release);

        let text = if is_close {
            "Canvas has been closed by the admin, please wait for a new canvas"
        } else {
            "Admin created a new canvas"
        };
        self.engine
            .publish(&members, None, ClientEvent::SyncWhiteboard(CanvasBlob::empty()));
        self.engine
            .publish(&members, None, ClientEvent::CanvasBlocked(is_close));
        self.engine.publish(
            &members,
            None,
            ClientEvent::Message {
                sender: SYSTEM_SENDER.to_string(),
                text: text.to_string(),
            },
        );
        log::info!("Admin '{requester}' cleared the canvas (close: {is_close})");
        Ok(())
    }

    /// Admin replaces the whole canvas. A corrupt blob leaves the current
    /// canvas untouched. Returns the number of imported actions.
    pub async fn import_canvas(&self, requester: &str, blob: CanvasBlob) -> SessionResult<usize> {
        let mut log = self.state.log.write().await;
        let members = {
            let registry = self.state.registry.lock().await;
            registry.ensure_admin(requester)?;
            registry.registered_handles()
        };

        let count = log.restore(&blob)?;
        if let Some(last_id) = log.actions().iter().map(|action| action.id).max() {
            self.state.next_action_id.fetch_max(last_id, Ordering::Relaxed);
        }
        self.state.canvas_closed.store(false, Ordering::Release);

        self.engine
            .publish(&members, None, ClientEvent::SyncWhiteboard(blob));
        self.engine
            .publish(&members, None, ClientEvent::CanvasBlocked(false));
        self.engine.publish(
            &members,
            None,
            ClientEvent::Message {
                sender: SYSTEM_SENDER.to_string(),
                text: "Admin imported a canvas".to_string(),
            },
        );
        log::info!("Admin '{requester}' imported a canvas with {count} action(s)");
        Ok(count)
    }

    /// Encode the current canvas for saving.
    pub async fn export_canvas(&self, requester: &str) -> SessionResult<CanvasBlob> {
        let log = self.state.log.read().await;
        self.state.registry.lock().await.ensure_registered(requester)?;
        log.snapshot()
    }

    /// Tell every client the server is going away and drop them all.
    pub async fn shutdown(&self, reason: &str) {
        let mut log = self.state.log.write().await;
        let handles = self.state.registry.lock().await.drain_all();
        log.clear();

        for handle in &handles {
            self.engine.send_to(
                handle,
                ClientEvent::ServerShutdown {
                    reason: reason.to_string(),
                },
            );
            self.engine.retire(handle);
        }
        log::info!("Notified {} client(s) of shutdown", handles.len());
    }

    /// Unregister clients the broadcast engine reports as unresponsive.
    ///
    /// Returns `None` if the eviction receiver was already taken.
    pub fn spawn_eviction_reaper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut evictions = self.engine.take_evictions()?;
        let coordinator = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(eviction) = evictions.recv().await {
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                log::warn!("Evicting unresponsive client '{}'", eviction.username);
                coordinator
                    .disconnect(&eviction.username, eviction.connection_id)
                    .await;
            }
        }))
    }

    pub async fn admin(&self) -> Option<String> {
        self.state.registry.lock().await.admin().map(str::to_string)
    }

    pub async fn registered_users(&self) -> Vec<String> {
        self.state.registry.lock().await.usernames()
    }

    pub async fn waiting_users(&self) -> Vec<String> {
        self.state.registry.lock().await.waiting_usernames()
    }

    pub async fn actions(&self) -> Vec<Action> {
        self.state.log.read().await.actions().to_vec()
    }

    pub async fn log_len(&self) -> usize {
        self.state.log.read().await.len()
    }

    pub fn is_canvas_closed(&self) -> bool {
        self.state.canvas_closed.load(Ordering::Acquire)
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.engine.stats()
    }
}

fn take_departure(
    registry: &mut SessionRegistry,
    username: &str,
    connection_id: Option<Uuid>,
) -> SessionResult<Option<Departure>> {
    match connection_id {
        Some(id) => Ok(registry.unregister_connection(username, id)),
        None => registry.unregister(username).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Point, ShapeKind};
    use crate::error::SessionError;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    type Events = mpsc::Receiver<Arc<ClientEvent>>;

    fn coordinator() -> SessionCoordinator {
        SessionCoordinator::new(BroadcastConfig {
            delivery_timeout: Duration::from_millis(100),
            max_consecutive_failures: 0,
        })
    }

    async fn next(rx: &mut Events) -> ClientEvent {
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        (*event).clone()
    }

    async fn drain(rx: &mut Events) {
        while let Ok(Some(_)) = timeout(Duration::from_millis(50), rx.recv()).await {}
    }

    async fn assert_silent(rx: &mut Events) {
        if let Ok(Some(event)) = timeout(Duration::from_millis(100), rx.recv()).await {
            panic!("Unexpected event: {event:?}");
        }
    }

    async fn admin(coordinator: &SessionCoordinator, name: &str) -> Events {
        let (handle, rx) = ClientHandle::channel(name, true, 64);
        coordinator.register_client(handle).await.unwrap();
        rx
    }

    async fn member(coordinator: &SessionCoordinator, admin: &str, name: &str) -> Events {
        let (handle, rx) = ClientHandle::channel(name, false, 64);
        coordinator.register_client(handle).await.unwrap();
        coordinator.accept_user_join(admin, name).await.unwrap();
        rx
    }

    fn stroke(author: &str) -> Action {
        Action::draw(
            author,
            ShapeKind::Freehand,
            vec![Point::new(0.0, 0.0), Point::new(10.0, 10.0)],
            "#000000",
            2.0,
        )
    }

    #[tokio::test]
    async fn test_admin_registration_sends_initial_state() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;

        assert_eq!(coordinator.admin().await.as_deref(), Some("Alice"));
        assert_eq!(coordinator.log_len().await, 0);
        assert_eq!(
            next(&mut alice).await,
            ClientEvent::InitialClientState {
                usernames: vec!["Alice".into()],
                is_admin: true
            }
        );
        assert_eq!(next(&mut alice).await, ClientEvent::SyncWhiteboard(CanvasBlob::empty()));
    }

    #[tokio::test]
    async fn test_join_waits_for_approval() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        drain(&mut alice).await;

        let (bob_handle, mut bob) = ClientHandle::channel("Bob", false, 64);
        coordinator.register_client(bob_handle).await.unwrap();
        assert_eq!(coordinator.waiting_users().await, ["Bob"]);
        assert_eq!(next(&mut alice).await, ClientEvent::AskUserJoin("Bob".into()));
        assert_silent(&mut bob).await;

        coordinator.accept_user_join("Alice", "Bob").await.unwrap();
        assert_eq!(coordinator.registered_users().await, ["Alice", "Bob"]);
        assert!(coordinator.waiting_users().await.is_empty());

        assert_eq!(
            next(&mut bob).await,
            ClientEvent::InitialClientState {
                usernames: vec!["Alice".into(), "Bob".into()],
                is_admin: false
            }
        );
        assert_eq!(next(&mut bob).await, ClientEvent::SyncWhiteboard(CanvasBlob::empty()));
        assert_eq!(next(&mut bob).await, ClientEvent::AddUser("Bob".into()));
        assert_eq!(next(&mut alice).await, ClientEvent::AddUser("Bob".into()));
    }

    #[tokio::test]
    async fn test_join_without_admin_fails() {
        let coordinator = coordinator();
        let (bob, _rx) = ClientHandle::channel("Bob", false, 8);
        assert_eq!(
            coordinator.register_client(bob).await.unwrap_err(),
            SessionError::NoAdminYet
        );
    }

    #[tokio::test]
    async fn test_second_admin_fails() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let (mallory, _rx) = ClientHandle::channel("Mallory", true, 8);
        assert_eq!(
            coordinator.register_client(mallory).await.unwrap_err(),
            SessionError::AlreadyHasAdmin("Alice".into())
        );
    }

    #[tokio::test]
    async fn test_only_admin_can_accept_or_refuse() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let _bob = member(&coordinator, "Alice", "Bob").await;
        let (carol, _rx) = ClientHandle::channel("Carol", false, 8);
        coordinator.register_client(carol).await.unwrap();

        assert!(matches!(
            coordinator.accept_user_join("Bob", "Carol").await,
            Err(SessionError::PermissionDenied(_))
        ));
        assert!(matches!(
            coordinator.refuse_user_join("Bob", "Carol").await,
            Err(SessionError::PermissionDenied(_))
        ));
        assert_eq!(coordinator.waiting_users().await, ["Carol"]);
    }

    #[tokio::test]
    async fn test_refuse_notifies_and_closes() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let (bob_handle, mut bob) = ClientHandle::channel("Bob", false, 8);
        coordinator.register_client(bob_handle).await.unwrap();

        coordinator.refuse_user_join("Alice", "Bob").await.unwrap();
        assert!(coordinator.waiting_users().await.is_empty());
        assert!(matches!(next(&mut bob).await, ClientEvent::Kicked { .. }));
        let closed = timeout(Duration::from_secs(1), bob.recv()).await.unwrap();
        assert!(closed.is_none());

        assert_eq!(
            coordinator.refuse_user_join("Alice", "Bob").await.unwrap_err(),
            SessionError::UnknownWaitingUser("Bob".into())
        );
    }

    #[tokio::test]
    async fn test_action_reaches_others_only() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        let mut bob = member(&coordinator, "Alice", "Bob").await;
        drain(&mut alice).await;
        drain(&mut bob).await;

        let id = coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(coordinator.log_len().await, 1);

        match next(&mut bob).await {
            ClientEvent::Action(action) => {
                assert_eq!(action.id, 1);
                assert_eq!(action.author, "Alice");
                assert_eq!(action.kind, stroke("Alice").kind);
            }
            other => panic!("Expected action, got {other:?}"),
        }
        assert_silent(&mut alice).await;
    }

    #[tokio::test]
    async fn test_author_is_forced_to_sender() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        coordinator.broadcast_action("Alice", stroke("Mallory")).await.unwrap();
        assert_eq!(coordinator.actions().await[0].author, "Alice");
    }

    #[tokio::test]
    async fn test_unregistered_sender_rejected() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let (bob, _rx) = ClientHandle::channel("Bob", false, 8);
        coordinator.register_client(bob).await.unwrap();

        // Still waiting: may not draw or chat yet.
        assert_eq!(
            coordinator.broadcast_action("Bob", stroke("Bob")).await.unwrap_err(),
            SessionError::NotRegistered("Bob".into())
        );
        assert_eq!(
            coordinator.broadcast_message("Bob", "hi").await.unwrap_err(),
            SessionError::NotRegistered("Bob".into())
        );
        assert_eq!(coordinator.log_len().await, 0);
    }

    #[tokio::test]
    async fn test_chat_message() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        let mut bob = member(&coordinator, "Alice", "Bob").await;
        drain(&mut alice).await;
        drain(&mut bob).await;

        coordinator.broadcast_message("Bob", "hello").await.unwrap();
        assert_eq!(
            next(&mut alice).await,
            ClientEvent::Message { sender: "Bob".into(), text: "hello".into() }
        );
        assert_silent(&mut bob).await;
    }

    #[tokio::test]
    async fn test_non_admin_kick_denied() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let _bob = member(&coordinator, "Alice", "Bob").await;

        assert!(matches!(
            coordinator.kick_user("Bob", "Alice", "x").await,
            Err(SessionError::PermissionDenied(_))
        ));
        assert_eq!(coordinator.registered_users().await, ["Alice", "Bob"]);
        assert_eq!(coordinator.admin().await.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_admin_kicks_member() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        let mut bob = member(&coordinator, "Alice", "Bob").await;
        let mut carol = member(&coordinator, "Alice", "Carol").await;
        drain(&mut alice).await;
        drain(&mut bob).await;
        drain(&mut carol).await;

        coordinator.kick_user("Alice", "Bob", "bye").await.unwrap();
        assert_eq!(next(&mut bob).await, ClientEvent::Kicked { reason: "bye".into() });
        assert!(timeout(Duration::from_secs(1), bob.recv()).await.unwrap().is_none());

        assert_eq!(coordinator.registered_users().await, ["Alice", "Carol"]);
        assert_eq!(next(&mut carol).await, ClientEvent::RemoveUser("Bob".into()));
        assert_eq!(next(&mut alice).await, ClientEvent::RemoveUser("Bob".into()));
    }

    #[tokio::test]
    async fn test_admin_cannot_kick_self() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        assert_eq!(
            coordinator.kick_user("Alice", "Alice", "x").await.unwrap_err(),
            SessionError::SelfKick
        );
    }

    #[tokio::test]
    async fn test_admin_departure_closes_session() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let mut carol = member(&coordinator, "Alice", "Carol").await;
        coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap();
        drain(&mut carol).await;

        coordinator.unregister_client("Alice").await.unwrap();
        assert_eq!(coordinator.admin().await, None);
        assert_eq!(coordinator.log_len().await, 0);
        assert!(coordinator.registered_users().await.is_empty());
        assert!(matches!(next(&mut carol).await, ClientEvent::Kicked { .. }));

        // A fresh admin can open a new session.
        let _dave = admin(&coordinator, "Dave").await;
        assert_eq!(coordinator.admin().await.as_deref(), Some("Dave"));
    }

    #[tokio::test]
    async fn test_admin_departure_with_dead_clients_completes() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let bob = member(&coordinator, "Alice", "Bob").await;
        let mut carol = member(&coordinator, "Alice", "Carol").await;
        drop(bob);
        drain(&mut carol).await;

        coordinator.unregister_client("Alice").await.unwrap();
        assert!(coordinator.registered_users().await.is_empty());
        assert!(matches!(next(&mut carol).await, ClientEvent::Kicked { .. }));
    }

    #[tokio::test]
    async fn test_member_leaves() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        let _bob = member(&coordinator, "Alice", "Bob").await;
        drain(&mut alice).await;

        coordinator.unregister_client("Bob").await.unwrap();
        assert_eq!(next(&mut alice).await, ClientEvent::RemoveUser("Bob".into()));
        assert_eq!(
            coordinator.unregister_client("Bob").await.unwrap_err(),
            SessionError::NotRegistered("Bob".into())
        );
    }

    #[tokio::test]
    async fn test_membership_changes_do_not_wait_for_the_log() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let _bob = member(&coordinator, "Alice", "Bob").await;
        let (carol, _carol_rx) = ClientHandle::channel("Carol", false, 64);
        let carol_id = carol.id();
        coordinator.register_client(carol).await.unwrap();
        coordinator.accept_user_join("Alice", "Carol").await.unwrap();

        let _log = coordinator.state.log.write().await;
        let quick = Duration::from_millis(500);

        let (dave, _dave_rx) = ClientHandle::channel("Dave", false, 64);
        timeout(quick, coordinator.register_client(dave))
            .await
            .expect("join blocked on the log")
            .unwrap();
        timeout(quick, coordinator.unregister_client("Bob"))
            .await
            .expect("unregister blocked on the log")
            .unwrap();
        timeout(quick, coordinator.disconnect("Carol", carol_id))
            .await
            .expect("disconnect blocked on the log");
        timeout(quick, coordinator.unregister_client("Dave"))
            .await
            .expect("withdrawal blocked on the log")
            .unwrap();

        let registry = coordinator.state.registry.lock().await;
        assert_eq!(registry.usernames(), ["Alice"]);
        assert!(registry.waiting_usernames().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_ignores_stale_connection() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        let _bob = member(&coordinator, "Alice", "Bob").await;

        coordinator.disconnect("Bob", Uuid::new_v4()).await;
        assert_eq!(coordinator.registered_users().await, ["Alice", "Bob"]);
    }

    #[tokio::test]
    async fn test_clear_empty_canvas_still_notifies() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        let mut bob = member(&coordinator, "Alice", "Bob").await;
        drain(&mut alice).await;
        drain(&mut bob).await;

        coordinator.clear_canvas("Alice", false).await.unwrap();
        assert_eq!(coordinator.log_len().await, 0);
        for rx in [&mut alice, &mut bob] {
            assert_eq!(next(rx).await, ClientEvent::SyncWhiteboard(CanvasBlob::empty()));
            assert_eq!(next(rx).await, ClientEvent::CanvasBlocked(false));
            assert!(matches!(next(rx).await, ClientEvent::Message { .. }));
        }
    }

    #[tokio::test]
    async fn test_close_canvas_blocks_later_joiners() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap();

        assert!(matches!(
            coordinator.clear_canvas("Bob", true).await,
            Err(SessionError::PermissionDenied(_))
        ));
        assert_eq!(coordinator.log_len().await, 1);

        coordinator.clear_canvas("Alice", true).await.unwrap();
        assert!(coordinator.is_canvas_closed());
        assert_eq!(coordinator.log_len().await, 0);

        let mut bob = member(&coordinator, "Alice", "Bob").await;
        assert!(matches!(next(&mut bob).await, ClientEvent::InitialClientState { .. }));
        assert_eq!(next(&mut bob).await, ClientEvent::SyncWhiteboard(CanvasBlob::empty()));
        assert_eq!(next(&mut bob).await, ClientEvent::CanvasBlocked(true));
    }

    #[tokio::test]
    async fn test_late_joiner_catches_up() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        for _ in 0..3 {
            coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap();
        }

        let mut bob = member(&coordinator, "Alice", "Bob").await;
        next(&mut bob).await;
        match next(&mut bob).await {
            ClientEvent::SyncWhiteboard(blob) => {
                assert_eq!(blob.decode().unwrap(), coordinator.actions().await);
            }
            other => panic!("Expected sync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_import_and_export() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        let mut bob = member(&coordinator, "Alice", "Bob").await;
        coordinator.broadcast_action("Bob", stroke("Bob")).await.unwrap();
        coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap();

        let saved = coordinator.export_canvas("Bob").await.unwrap();
        coordinator.clear_canvas("Alice", false).await.unwrap();
        drain(&mut alice).await;
        drain(&mut bob).await;

        assert!(matches!(
            coordinator.import_canvas("Bob", saved.clone()).await,
            Err(SessionError::PermissionDenied(_))
        ));
        assert_eq!(coordinator.import_canvas("Alice", saved.clone()).await.unwrap(), 2);
        assert_eq!(coordinator.export_canvas("Alice").await.unwrap(), saved);
        assert_eq!(next(&mut bob).await, ClientEvent::SyncWhiteboard(saved));
    }

    #[tokio::test]
    async fn test_import_advances_action_ids() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        assert_eq!(coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap(), 1);

        let saved: Vec<Action> = [40, 41]
            .into_iter()
            .map(|id| Action { id, ..stroke("Bob") })
            .collect();
        let blob = CanvasBlob::encode(&saved).unwrap();
        coordinator.import_canvas("Alice", blob).await.unwrap();
        assert_eq!(coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap(), 42);

        // Importing older ids never moves the counter back.
        let old = CanvasBlob::encode(&[Action { id: 3, ..stroke("Bob") }]).unwrap();
        coordinator.import_canvas("Alice", old).await.unwrap();
        assert_eq!(coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap(), 43);

        let ids: Vec<u64> = coordinator.actions().await.iter().map(|a| a.id).collect();
        assert_eq!(ids, [3, 43]);
    }

    #[tokio::test]
    async fn test_corrupt_import_keeps_canvas() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap();

        let err = coordinator
            .import_canvas("Alice", CanvasBlob::from(b"not a canvas".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::CorruptData(_)));
        assert_eq!(coordinator.log_len().await, 1);
    }

    #[tokio::test]
    async fn test_export_requires_membership() {
        let coordinator = coordinator();
        let _alice = admin(&coordinator, "Alice").await;
        assert_eq!(
            coordinator.export_canvas("Eve").await.unwrap_err(),
            SessionError::NotRegistered("Eve".into())
        );
    }

    #[tokio::test]
    async fn test_shutdown_notifies_everyone() {
        let coordinator = coordinator();
        let mut alice = admin(&coordinator, "Alice").await;
        let (bob_handle, mut bob) = ClientHandle::channel("Bob", false, 8);
        coordinator.register_client(bob_handle).await.unwrap();
        drain(&mut alice).await;

        coordinator.shutdown("maintenance").await;
        assert_eq!(coordinator.admin().await, None);
        for rx in [&mut alice, &mut bob] {
            assert_eq!(
                next(rx).await,
                ClientEvent::ServerShutdown { reason: "maintenance".into() }
            );
        }
    }

    #[tokio::test]
    async fn test_unresponsive_client_is_evicted() {
        let coordinator = Arc::new(SessionCoordinator::new(BroadcastConfig {
            delivery_timeout: Duration::from_millis(20),
            max_consecutive_failures: 2,
        }));
        coordinator.spawn_eviction_reaper().unwrap();
        assert!(coordinator.spawn_eviction_reaper().is_none());

        let _alice = admin(&coordinator, "Alice").await;
        let bob = member(&coordinator, "Alice", "Bob").await;
        drop(bob);

        for _ in 0..3 {
            coordinator.broadcast_action("Alice", stroke("Alice")).await.unwrap();
        }

        let evicted = timeout(Duration::from_secs(2), async {
            while coordinator.registered_users().await.contains(&"Bob".to_string()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(evicted.is_ok(), "Bob should have been evicted");
        assert_eq!(coordinator.admin().await.as_deref(), Some("Alice"));
    }
}
