//! The engine actor.
//!
//! One task owns the state machine. Gateways and HTTP handlers talk to it
//! through an [`EngineHandle`]; commands are processed strictly one after
//! another, each inside a single store transaction, and their effects are
//! delivered only after the transaction commits.

use crate::broadcast::{Delivery, Outbox};
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, CoreResult};
use crate::hub::{ConnId, EventReceiver, Hub};
use crate::services::{FileStore, StoredFile};
use crate::store::{users, Store, UserRow};
use huddle_protocol::{Action, MessageRecord, UserRecord, DEFAULT_PAGE_SIZE, SYSTEM_USER_ID};
use sqlx::SqliteConnection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Messages in a resync and the default pagination limit.
    pub page_size: u32,
    /// Upper bound of a pagination limit.
    pub max_page_size: u32,
    /// How long soft-deleted messages are kept.
    pub retention: chrono::Duration,
    /// Delay before a user whose last connection dropped leaves its room.
    /// `None` disables the automatic leave.
    pub disconnect_grace: Option<Duration>,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_page_size: 100,
            retention: chrono::Duration::days(7),
            disconnect_grace: Some(Duration::from_secs(30)),
            command_buffer: 1024,
        }
    }
}

/// An upload that has been persisted and must become a message.
#[derive(Debug, Clone)]
pub struct FileArrival {
    pub user_id: String,
    pub room_id: String,
    /// Original file name shown to members.
    pub file_name: String,
    pub file: StoredFile,
    /// Correlation id echoed back to the uploader.
    pub client_id: Option<String>,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired rows found.
    pub examined: usize,
    /// Rows actually deleted.
    pub removed: usize,
    /// Rows whose deletion failed.
    pub failed: usize,
}

pub(crate) enum Command {
    Action {
        conn: ConnId,
        action: Action,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    Identify {
        user_id: Option<String>,
        default_name: String,
        reply: oneshot::Sender<CoreResult<UserRecord>>,
    },
    Rename {
        user_id: String,
        name: String,
        reply: oneshot::Sender<CoreResult<UserRecord>>,
    },
    CheckMember {
        user_id: String,
        room_id: String,
        reply: oneshot::Sender<CoreResult<()>>,
    },
    FileArrived {
        arrival: FileArrival,
        reply: oneshot::Sender<CoreResult<MessageRecord>>,
    },
    Disconnected {
        conn: ConnId,
    },
    GraceExpired {
        user: String,
    },
    Sweep {
        reply: oneshot::Sender<CoreResult<SweepReport>>,
    },
}

/// The room engine.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) hub: Arc<Hub>,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    /// Create an engine with the wall clock and default configuration.
    #[must_use]
    pub fn new(store: Store, hub: Arc<Hub>, files: Arc<dyn FileStore>) -> Self {
        Self {
            store,
            hub,
            files,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawn the actor task.
    pub fn start(self) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.config.command_buffer.max(1));
        let handle = EngineHandle {
            tx: tx.clone(),
            hub: Arc::clone(&self.hub),
        };
        let weak = tx.downgrade();
        drop(tx);

        info!(
            page_size = self.config.page_size,
            grace = ?self.config.disconnect_grace,
            "Starting engine"
        );
        let task = tokio::spawn(self.run(rx, weak));
        (handle, task)
    }

    async fn run(self, mut rx: mpsc::Receiver<Command>, weak: mpsc::WeakSender<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command, &weak).await;
        }
        info!("Engine stopped");
    }

    async fn handle(&self, command: Command, weak: &mpsc::WeakSender<Command>) {
        match command {
            Command::Action {
                conn,
                action,
                reply,
            } => {
                let result = self.run_action(conn, action).await;
                let _ = reply.send(result);
            }
            Command::Identify {
                user_id,
                default_name,
                reply,
            } => {
                let result = self.run_identify(user_id, &default_name).await;
                let _ = reply.send(result);
            }
            Command::Rename {
                user_id,
                name,
                reply,
            } => {
                let result = self.run_rename(&user_id, &name).await;
                let _ = reply.send(result);
            }
            Command::CheckMember {
                user_id,
                room_id,
                reply,
            } => {
                let result = async {
                    let mut conn = self.store.pool().acquire().await?;
                    self.ensure_member(&mut conn, &user_id, &room_id).await
                }
                .await;
                let _ = reply.send(result);
            }
            Command::FileArrived { arrival, reply } => {
                let result = self.run_file_arrival(arrival).await;
                let _ = reply.send(result);
            }
            Command::Disconnected { conn } => self.on_disconnect(conn, weak),
            Command::GraceExpired { user } => self.on_grace_expired(&user).await,
            Command::Sweep { reply } => {
                let result = self.sweep(self.clock.now()).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn run_action(&self, conn: ConnId, action: Action) -> CoreResult<()> {
        let name = action.name();
        debug!(connection = conn, action = name, "Action");

        let result = async {
            if !matches!(action, Action::Identify { .. }) {
                if let Some(user) = action.acting_user() {
                    self.check_binding(conn, user)?;
                }
            }
            let acting_user = action.acting_user().map(str::to_string);

            let mut tx = self.store.begin().await?;
            let mut out = Outbox::new();
            self.apply(&mut tx, &mut out, conn, action).await?;
            if let Some(user) = acting_user {
                if self.hub.user_of(conn).is_none() {
                    out.bind(conn, &user);
                }
            }
            tx.commit().await?;
            self.delivery().flush(out).await;
            Ok::<_, CoreError>(())
        }
        .await;

        if let Err(e) = &result {
            if e.is_client_error() {
                debug!(connection = conn, action = name, error = %e, "Action rejected");
            } else {
                error!(connection = conn, action = name, error = %e, "Action failed");
            }
            self.hub.send_to_conn(conn, Arc::new(e.to_event()));
        }
        result
    }

    /// A connection bound to one user may not act as another.
    fn check_binding(&self, conn: ConnId, user: &str) -> CoreResult<()> {
        if user.is_empty() {
            return Err(CoreError::Validation("Missing user id.".to_string()));
        }
        match self.hub.user_of(conn) {
            Some(bound) if bound != user => Err(CoreError::Forbidden(
                "This connection belongs to another user.".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn apply(
        &self,
        tx: &mut SqliteConnection,
        out: &mut Outbox,
        conn: ConnId,
        action: Action,
    ) -> CoreResult<()> {
        match action {
            Action::Identify { user_id } => self.identify_connection(tx, out, conn, &user_id).await,
            Action::JoinRoom { user_id, room_id } => {
                self.join(tx, out, conn, &user_id, room_id.as_deref()).await
            }
            Action::SendMessage {
                user_id,
                content,
                url_metadata,
            } => self.send_message(tx, out, &user_id, &content, url_metadata).await,
            Action::TogglePin {
                user_id,
                message_id,
            } => self.toggle_pin(tx, out, &user_id, message_id).await,
            Action::LeaveRoom { user_id } => self.leave(tx, out, &user_id).await,
            Action::KickMember {
                action_user_id,
                target_user_id,
            } => self.kick(tx, out, &action_user_id, &target_user_id).await,
            Action::InvitePairedDevice {
                host_id,
                target_token,
            } => self.invite(tx, out, &host_id, &target_token).await,
            Action::LoadMoreMessages {
                room_id,
                before_id,
                limit,
            } => {
                self.load_more(tx, out, conn, &room_id, before_id, limit)
                    .await
            }
            Action::SoftDeleteMessages {
                user_id,
                message_ids,
            } => self.delete_messages(tx, out, &user_id, &message_ids).await,
            Action::RestoreMessages {
                user_id,
                message_ids,
            } => self.restore_messages(tx, out, &user_id, &message_ids).await,
            Action::RestoreAllMessages { user_id } => self.restore_all(tx, out, &user_id).await,
            Action::Ping { timestamp } => {
                out.to_conn(conn, huddle_protocol::Event::Pong { timestamp });
                Ok(())
            }
        }
    }

    async fn run_identify(&self, user_id: Option<String>, default_name: &str) -> CoreResult<UserRecord> {
        let mut tx = self.store.begin().await?;
        if let Some(id) = user_id.as_deref().filter(|id| !id.is_empty()) {
            if let Some(user) = find_user(&mut tx, id).await? {
                return Ok(user.to_record());
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let name = normalize_name(default_name).unwrap_or_else(|_| "Unknown Device".to_string());
        let user = users::insert(&mut tx, &id, &name, self.now_millis()).await?;
        tx.commit().await?;

        info!(user = %id, name = %name, "User created");
        Ok(user.to_record())
    }

    async fn run_rename(&self, user_id: &str, name: &str) -> CoreResult<UserRecord> {
        let name = normalize_name(name)?;
        let mut tx = self.store.begin().await?;
        let mut out = Outbox::new();

        let mut user = load_user(&mut tx, user_id).await?;
        users::rename(&mut tx, user_id, &name).await?;
        user.name = name;
        let record = user.to_record();
        if let Some(room) = &user.room_id {
            out.to_room(
                room,
                huddle_protocol::Event::UserUpdated {
                    user: record.clone(),
                },
            );
        }

        tx.commit().await?;
        self.delivery().flush(out).await;
        debug!(user = %user_id, "User renamed");
        Ok(record)
    }

    async fn run_file_arrival(&self, arrival: FileArrival) -> CoreResult<MessageRecord> {
        let urls = arrival.file.urls();
        let result = async {
            let mut tx = self.store.begin().await?;
            let mut out = Outbox::new();
            let record = self.file_arrived(&mut tx, &mut out, arrival).await?;
            tx.commit().await?;
            self.delivery().flush(out).await;
            Ok::<_, CoreError>(record)
        }
        .await;

        if result.is_err() {
            for url in urls {
                if let Err(e) = self.files.remove(&url).await {
                    warn!(url = %url, error = %e, "Failed to remove rejected upload");
                }
            }
        }
        result
    }

    fn on_disconnect(&self, conn: ConnId, weak: &mpsc::WeakSender<Command>) {
        let Some(user) = self.hub.disconnect(conn) else {
            return;
        };
        if self.hub.is_user_connected(&user) {
            return;
        }
        let Some(grace) = self.config.disconnect_grace else {
            return;
        };

        debug!(user = %user, grace = ?grace, "Last connection dropped");
        let weak = weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Command::GraceExpired { user }).await;
            }
        });
    }

    async fn on_grace_expired(&self, user: &str) {
        if self.hub.is_user_connected(user) {
            return;
        }
        let result = async {
            let mut tx = self.store.begin().await?;
            let mut out = Outbox::new();
            self.leave(&mut tx, &mut out, user).await?;
            tx.commit().await?;
            self.delivery().flush(out).await;
            Ok::<_, CoreError>(())
        }
        .await;

        match result {
            Ok(()) => info!(user = %user, "Left room after disconnect"),
            Err(CoreError::NotFound(_)) => {}
            Err(e) => warn!(user = %user, error = %e, "Disconnect leave failed"),
        }
    }

    pub(crate) fn delivery(&self) -> Delivery<'_> {
        Delivery {
            store: &self.store,
            hub: &self.hub,
            files: self.files.as_ref(),
            page_size: self.config.page_size,
        }
    }

    pub(crate) fn now_millis(&self) -> i64 {
        crate::store::millis(self.clock.now())
    }
}

/// A user that may act, i.e. exists and is not the system author.
pub(crate) async fn find_user(conn: &mut SqliteConnection, user_id: &str) -> CoreResult<Option<UserRow>> {
    if user_id == SYSTEM_USER_ID {
        return Ok(None);
    }
    Ok(users::find(conn, user_id).await?)
}

pub(crate) async fn load_user(conn: &mut SqliteConnection, user_id: &str) -> CoreResult<UserRow> {
    find_user(conn, user_id)
        .await?
        .ok_or_else(|| CoreError::user_not_found(user_id))
}

/// Trim a display name and check its length.
pub(crate) fn normalize_name(name: &str) -> CoreResult<String> {
    let name = name.trim();
    let len = name.chars().count();
    if len == 0 || len > 64 {
        return Err(CoreError::Validation(
            "Name must be between 1 and 64 characters.".to_string(),
        ));
    }
    Ok(name.to_string())
}

/// Cloneable front of the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
    hub: Arc<Hub>,
}

impl EngineHandle {
    /// The connection hub shared with the engine.
    #[must_use]
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Register a connection.
    pub fn connect(&self) -> (ConnId, EventReceiver) {
        self.hub.connect()
    }

    /// Submit an action on behalf of a connection.
    ///
    /// Failures are also delivered to the connection as an error event.
    ///
    /// # Errors
    ///
    /// Returns the action's error, or `Unavailable` if the engine is gone.
    pub async fn dispatch(&self, conn: ConnId, action: Action) -> CoreResult<()> {
        self.request(|reply| Command::Action {
            conn,
            action,
            reply,
        })
        .await
    }

    /// Return the user with `user_id`, or create a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the engine is gone.
    pub async fn identify(
        &self,
        user_id: Option<String>,
        default_name: impl Into<String>,
    ) -> CoreResult<UserRecord> {
        let default_name = default_name.into();
        self.request(|reply| Command::Identify {
            user_id,
            default_name,
            reply,
        })
        .await
    }

    /// Change a user's display name.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an empty or overlong name, `NotFound` for an
    /// unknown user.
    pub async fn rename(&self, user_id: impl Into<String>, name: impl Into<String>) -> CoreResult<UserRecord> {
        let user_id = user_id.into();
        let name = name.into();
        self.request(|reply| Command::Rename {
            user_id,
            name,
            reply,
        })
        .await
    }

    /// Check that a user belongs to a room before accepting its upload.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the user is unknown or in another room.
    pub async fn ensure_member(&self, user_id: impl Into<String>, room_id: impl Into<String>) -> CoreResult<()> {
        let user_id = user_id.into();
        let room_id = room_id.into();
        self.request(|reply| Command::CheckMember {
            user_id,
            room_id,
            reply,
        })
        .await
    }

    /// Record a stored upload as a file message.
    ///
    /// # Errors
    ///
    /// Returns `Forbidden` if the author is not a member of the room; the
    /// payload is removed in that case.
    pub async fn file_arrived(&self, arrival: FileArrival) -> CoreResult<MessageRecord> {
        self.request(|reply| Command::FileArrived { arrival, reply })
            .await
    }

    /// Report a closed connection.
    pub async fn disconnected(&self, conn: ConnId) {
        if self.tx.send(Command::Disconnected { conn }).await.is_err() {
            self.hub.disconnect(conn);
        }
    }

    /// Run an expiry sweep now.
    ///
    /// # Errors
    ///
    /// Returns an error if candidates cannot be selected.
    pub async fn sweep(&self) -> CoreResult<SweepReport> {
        self.request(|reply| Command::Sweep { reply }).await
    }

    /// Run a sweep every `every`, starting immediately. `on_report` sees
    /// every completed sweep.
    pub fn spawn_sweeper<F>(&self, every: Duration, on_report: F) -> JoinHandle<()>
    where
        F: Fn(&SweepReport) + Send + 'static,
    {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match handle.sweep().await {
                    Ok(report) => {
                        if report.examined > 0 {
                            info!(
                                removed = report.removed,
                                failed = report.failed,
                                "Expired messages swept"
                            );
                        }
                        on_report(&report);
                    }
                    Err(CoreError::Unavailable) => break,
                    Err(e) => warn!(error = %e, "Sweep failed"),
                }
            }
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<CoreResult<T>>) -> Command,
    ) -> CoreResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CoreError::Unavailable)?;
        rx.await.map_err(|_| CoreError::Unavailable)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::MemoryFileStore;
    use huddle_protocol::Event;

    async fn engine() -> (EngineHandle, Arc<MemoryFileStore>) {
        let store = Store::in_memory().await.unwrap();
        let files = Arc::new(MemoryFileStore::new());
        let clock = Arc::new(ManualClock::new(crate::clock::from_millis(1_700_000_000_000)));
        let (handle, _task) = Engine::new(store, Arc::new(Hub::new()), files.clone())
            .with_clock(clock)
            .start();
        (handle, files)
    }

    #[tokio::test]
    async fn test_identify_reuses_known_user() {
        let (engine, _) = engine().await;

        let created = engine.identify(None, "Linux (Firefox)").await.unwrap();
        assert_eq!(created.name, "Linux (Firefox)");

        let again = engine.identify(Some(created.id.clone()), "Other").await.unwrap();
        assert_eq!(again, created);

        let system = engine.identify(Some("system".into()), "Other").await.unwrap();
        assert_ne!(system.id, "system");
    }

    #[tokio::test]
    async fn test_rename_validates() {
        let (engine, _) = engine().await;
        let user = engine.identify(None, "Phone").await.unwrap();

        let renamed = engine.rename(&user.id, "  Alice  ").await.unwrap();
        assert_eq!(renamed.name, "Alice");

        assert!(matches!(
            engine.rename(&user.id, "   ").await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            engine.rename(&user.id, "x".repeat(65)).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            engine.rename("nobody", "Bob").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_binding_is_enforced() {
        let (engine, _) = engine().await;
        let alice = engine.identify(None, "Alice").await.unwrap();
        let bob = engine.identify(None, "Bob").await.unwrap();
        let (conn, mut rx) = engine.connect();

        engine.dispatch(conn, Action::join(&alice.id, None)).await.unwrap();
        assert_eq!(engine.hub().user_of(conn), Some(alice.id.clone()));

        let err = engine
            .dispatch(conn, Action::send(&bob.id, "spoofed"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Forbidden(_)));

        let mut saw_error = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::Error { code, .. } = &*event {
                assert_eq!(*code, 403);
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (engine, _) = engine().await;
        let (conn, mut rx) = engine.connect();
        engine
            .dispatch(conn, Action::Ping { timestamp: Some(42) })
            .await
            .unwrap();
        assert_eq!(*rx.recv().await.unwrap(), Event::Pong { timestamp: Some(42) });
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_engine() {
        let (engine, _) = engine().await;
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let dead = EngineHandle {
            tx,
            hub: Arc::clone(engine.hub()),
        };
        assert!(matches!(dead.sweep().await, Err(CoreError::Unavailable)));
    }

    #[tokio::test]
    async fn test_disconnect_grace_leaves_room() {
        let store = Store::in_memory().await.unwrap();
        let config = EngineConfig {
            disconnect_grace: Some(Duration::from_millis(20)),
            ..EngineConfig::default()
        };
        let (engine, _task) = Engine::new(store, Arc::new(Hub::new()), Arc::new(MemoryFileStore::new()))
            .with_config(config)
            .start();

        let alice = engine.identify(None, "Alice").await.unwrap();
        let bob = engine.identify(None, "Bob").await.unwrap();
        let (a, _rx_a) = engine.connect();
        let (b, mut rx_b) = engine.connect();
        engine.dispatch(a, Action::join(&alice.id, None)).await.unwrap();
        let room = engine.hub().room_of(a).unwrap();
        engine
            .dispatch(b, Action::join(&bob.id, Some(room.clone())))
            .await
            .unwrap();

        engine.disconnected(a).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Any command queued behind the grace timer has run once this returns.
        engine.sweep().await.unwrap();

        let mut host_message = false;
        while let Ok(event) = rx_b.try_recv() {
            if let Event::NewMessage { message } = &*event {
                if message.content == "Bob is now the Host." {
                    host_message = true;
                }
            }
        }
        assert!(host_message);
    }

    #[tokio::test]
    async fn test_sweeper_reports_each_run() {
        let (engine, _) = engine().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sweeper = engine.spawn_sweeper(Duration::from_secs(3600), move |report| {
            let _ = tx.send(report.examined);
        });

        assert_eq!(rx.recv().await, Some(0));
        sweeper.abort();
    }
}
