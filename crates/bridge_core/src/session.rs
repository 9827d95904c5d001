use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{PresenceState, RoomId, UserId},
    error::ErrorKind,
    protocol::{
        AudioMessage, DocumentMessage, ImageMessage, MsgInfo, PhoneInfo, Presence,
        PresenceStatus, RemoteEvent, SessionCredential, StreamEvent, StreamKind, TextMessage,
        VideoMessage,
    },
};
use storage::UserRecord;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::{
    error::SessionError,
    pairing::{self, CODE_CHANNEL_CAPACITY},
    portal::{ChatRoomDirectory, MediaKind, MediaMessage},
    puppet::ContactGhostDirectory,
    registry::UserRegistry,
    BridgeContext, EventHandler, RemoteConnection, TYPING_HINT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected and replaying the stored credential.
    Restoring,
    /// Connected but not authenticated.
    Connected,
    LoggedIn,
}

struct ConnectionSlot {
    state: ConnectionState,
    conn: Option<Arc<dyn RemoteConnection>>,
}

/// One bridged user: their remote connection, persisted record and the two
/// directories derived from remote events.
pub struct UserSession {
    user_id: UserId,
    ctx: BridgeContext,
    registry: Weak<UserRegistry>,
    record: Mutex<UserRecord>,
    connection: RwLock<ConnectionSlot>,
    connect_lock: Mutex<()>,
    restore_failures: AtomicU32,
    portals: ChatRoomDirectory,
    puppets: ContactGhostDirectory,
    span: Span,
}

impl UserSession {
    pub(crate) fn new(
        record: UserRecord,
        ctx: BridgeContext,
        registry: Weak<UserRegistry>,
    ) -> Arc<Self> {
        let user_id = record.user_id.clone();
        Arc::new(Self {
            span: info_span!("user_session", user_id = %user_id),
            portals: ChatRoomDirectory::new(user_id.clone(), Arc::clone(&ctx.portals)),
            puppets: ContactGhostDirectory::new(ctx.config.clone(), Arc::clone(&ctx.intents)),
            user_id,
            ctx,
            registry,
            record: Mutex::new(record),
            connection: RwLock::new(ConnectionSlot {
                state: ConnectionState::Disconnected,
                conn: None,
            }),
            connect_lock: Mutex::new(()),
            restore_failures: AtomicU32::new(0),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn portals(&self) -> &ChatRoomDirectory {
        &self.portals
    }

    pub fn puppets(&self) -> &ContactGhostDirectory {
        &self.puppets
    }

    pub async fn management_room(&self) -> Option<RoomId> {
        self.record.lock().await.management_room.clone()
    }

    pub async fn session_credential(&self) -> Option<SessionCredential> {
        self.record.lock().await.session.clone()
    }

    pub async fn has_session(&self) -> bool {
        self.record.lock().await.session.is_some()
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.read().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.conn.is_some()
    }

    /// Consecutive failed restores since the last successful one.
    pub fn restore_failures(&self) -> u32 {
        self.restore_failures.load(Ordering::Relaxed)
    }

    async fn connection(&self) -> Option<Arc<dyn RemoteConnection>> {
        self.connection.read().await.conn.clone()
    }

    async fn set_state(&self, state: ConnectionState) {
        self.connection.write().await.state = state;
    }

    async fn persist(&self, record: &UserRecord) {
        if let Err(err) = self.ctx.credentials.update_user(record).await {
            error!(
                parent: &self.span,
                kind = %ErrorKind::Storage,
                "session: failed to persist user record: {err:#}"
            );
        }
    }

    /// Makes `room` this user's management room. Whoever owned it before
    /// loses it.
    pub async fn set_management_room(self: &Arc<Self>, room: RoomId) {
        match self.registry.upgrade() {
            Some(registry) => registry.assign_management_room(self, room).await,
            None => self.replace_management_room(Some(room)).await,
        }
    }

    pub(crate) async fn replace_management_room(&self, room: Option<RoomId>) {
        let mut record = self.record.lock().await;
        record.management_room = room;
        self.persist(&record).await;
    }

    pub async fn set_session(&self, session: Option<SessionCredential>) {
        let mut record = self.record.lock().await;
        record.session = session;
        self.persist(&record).await;
    }

    /// Connects with the stored credential and syncs on success.
    pub async fn start(self: &Arc<Self>) {
        if self.connect(false).await {
            self.sync().await;
        }
    }

    /// Opens the remote connection and restores the stored credential.
    ///
    /// Returns `true` right away when already connected. Without a stored
    /// credential this fails unless `force` is set, in which case the session
    /// ends up connected but unauthenticated.
    pub async fn connect(self: &Arc<Self>, force: bool) -> bool {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected().await {
            return true;
        }
        let has_session = self.has_session().await;
        if !force && !has_session {
            return false;
        }

        self.set_state(ConnectionState::Connecting).await;
        debug!(parent: &self.span, "session: connecting to remote network");
        let conn = match self.ctx.connector.connect(self.ctx.config.connect_timeout).await {
            Ok(conn) => conn,
            Err(err) => {
                let err = SessionError::Connect(err);
                error!(parent: &self.span, kind = %err.kind(), "session: {err}");
                self.set_state(ConnectionState::Disconnected).await;
                return false;
            }
        };
        conn.add_handler(Arc::new(SessionEventSink {
            session: Arc::downgrade(self),
        }));
        {
            let mut slot = self.connection.write().await;
            slot.conn = Some(conn);
            slot.state = ConnectionState::Connected;
        }
        debug!(parent: &self.span, "session: connection established");

        if !has_session {
            return true;
        }
        self.restore_session().await
    }

    /// Replays the stored credential on the live connection. A failed restore
    /// keeps the credential so the next connect retries it.
    pub async fn restore_session(&self) -> bool {
        let Some(credential) = self.session_credential().await else {
            debug!(parent: &self.span, "session: {}", SessionError::NoCredential);
            return false;
        };
        let Some(conn) = self.connection().await else {
            warn!(parent: &self.span, "session: {}", SessionError::NotConnected);
            return false;
        };

        self.set_state(ConnectionState::Restoring).await;
        match conn.restore_session(credential).await {
            Ok(fresh) => {
                self.restore_failures.store(0, Ordering::Relaxed);
                self.set_session(Some(fresh)).await;
                self.set_state(ConnectionState::LoggedIn).await;
                debug!(parent: &self.span, "session: restored successfully");
                true
            }
            Err(err) => {
                let failures = self.restore_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let err = SessionError::Restore(err);
                error!(
                    parent: &self.span,
                    kind = %err.kind(),
                    consecutive_failures = failures,
                    "session: {err}"
                );
                self.set_state(ConnectionState::Connected).await;
                false
            }
        }
    }

    /// Pairs a new device by posting QR codes to `room`.
    pub async fn login(self: &Arc<Self>, room: &RoomId) {
        let bot = self.ctx.intents.bot();
        let Some(conn) = self.connection().await else {
            let err = SessionError::NotConnected;
            warn!(parent: &self.span, room_id = %room, "session: login refused: {err}");
            self.notify(room, &format!("Failed to log in: {err}")).await;
            return;
        };

        let (codes_tx, codes_rx) = mpsc::channel::<String>(CODE_CHANNEL_CAPACITY);
        pairing::spawn_qr_relay(Arc::clone(&bot), room.clone(), codes_rx, self.span.clone());

        match conn.login(codes_tx.clone()).await {
            Ok(credential) => {
                self.restore_failures.store(0, Ordering::Relaxed);
                self.set_session(Some(credential)).await;
                self.set_state(ConnectionState::LoggedIn).await;
                info!(parent: &self.span, room_id = %room, "session: logged in");
                self.notify(room, "Successfully logged in. Synchronizing chats...")
                    .await;
                let session = Arc::clone(self);
                tokio::spawn(async move { session.sync().await });
            }
            Err(cause) => {
                let notice = format!("Failed to log in: {cause:#}");
                let err = SessionError::Login(cause);
                warn!(parent: &self.span, room_id = %room, kind = %err.kind(), "session: {err}");
                self.notify(room, &notice).await;
                pairing::cancel_relay(&codes_tx);
            }
        }
    }

    /// Closes the connection. Returns whether there was one.
    pub async fn disconnect(&self) -> bool {
        let _guard = self.connect_lock.lock().await;
        let conn = {
            let mut slot = self.connection.write().await;
            slot.state = ConnectionState::Disconnected;
            slot.conn.take()
        };
        let Some(conn) = conn else {
            return false;
        };
        if let Err(err) = conn.disconnect().await {
            warn!(parent: &self.span, "session: disconnect failed: {err:#}");
        }
        info!(parent: &self.span, "session: disconnected");
        true
    }

    /// Logs out of the remote network and forgets the stored credential.
    /// Returns whether a credential was stored.
    pub async fn logout(&self) -> bool {
        let had_session = self.has_session().await;
        if let Some(conn) = self.connection().await {
            if let Err(err) = conn.logout().await {
                warn!(parent: &self.span, "session: remote logout failed: {err:#}");
            }
        }
        self.disconnect().await;
        self.set_session(None).await;
        self.restore_failures.store(0, Ordering::Relaxed);
        if had_session {
            info!(parent: &self.span, "session: logged out");
            self.notify_management_room("Logged out of WhatsApp.").await;
        }
        had_session
    }

    /// Mirrors the remote contact list into the ghost and portal directories.
    ///
    /// Individual contacts without a push name have never been messaged and
    /// get no portal; groups always do.
    pub async fn sync(&self) {
        async {
            let Some(conn) = self.connection().await else {
                warn!("sync: {}", SessionError::NotConnected);
                return;
            };
            debug!("sync: fetching contacts");
            let contacts = match conn.contacts().await {
                Ok(contacts) => contacts,
                Err(err) => {
                    let err = SessionError::Contacts(err);
                    error!(kind = %err.kind(), "sync: {err}");
                    return;
                }
            };

            let mut bridged = 0usize;
            for contact in &contacts {
                if contact.jid.is_user() {
                    let puppet = self.puppets.get_or_create(&contact.jid).await;
                    puppet.sync(contact).await;
                }

                if contact.notify.is_empty() && !contact.jid.is_group() {
                    continue;
                }

                let portal = self.portals.get_or_create(&contact.jid).await;
                portal.sync(contact).await;
                self.portals.ensure_room(&portal).await;
                bridged += 1;
            }
            info!(contacts = contacts.len(), bridged, "sync: finished");
        }
        .instrument(self.span.clone())
        .await
    }

    async fn notify(&self, room: &RoomId, text: &str) {
        if let Err(err) = self.ctx.intents.bot().send_notice(room, text).await {
            warn!(parent: &self.span, room_id = %room, "session: failed to send notice: {err:#}");
        }
    }

    async fn notify_management_room(&self, text: &str) {
        if let Some(room) = self.management_room().await {
            self.notify(&room, text).await;
        }
    }

    /// Dispatches one remote event. Failures are logged, never returned.
    pub async fn handle_event(&self, event: RemoteEvent) {
        let kind = event.kind();
        async {
            match event {
                RemoteEvent::Error(err) => {
                    error!(kind = %ErrorKind::Transport, "remote: connection error: {err}");
                }
                RemoteEvent::JsonParseError(err) => {
                    error!(kind = %ErrorKind::Decode, "remote: JSON parse error: {err}");
                }
                RemoteEvent::Json(raw) => debug!(raw = %raw, "remote: JSON message"),
                RemoteEvent::Text(message) => self.handle_text_message(message).await,
                RemoteEvent::Image(message) => self.handle_image_message(message).await,
                RemoteEvent::Video(message) => self.handle_video_message(message).await,
                RemoteEvent::Audio(message) => self.handle_audio_message(message).await,
                RemoteEvent::Document(message) => self.handle_document_message(message).await,
                RemoteEvent::Stream(stream) => self.handle_stream_event(stream).await,
                RemoteEvent::ConnInfo(info) => {
                    if !info.protocol_version.is_empty() {
                        self.notify_management_room(&client_connected_notice(&info.phone))
                            .await;
                    }
                }
                RemoteEvent::Presence(presence) => self.handle_presence(presence).await,
                RemoteEvent::MsgInfo(info) => self.handle_msg_info(info).await,
            }
        }
        .instrument(info_span!(parent: &self.span, "remote_event", kind))
        .await
    }

    async fn handle_text_message(&self, message: TextMessage) {
        debug!(jid = %message.info.remote_jid, message_id = %message.info.id, "message: text received");
        let portal = self.portals.get_or_create(&message.info.remote_jid).await;
        self.portals.ensure_room(&portal).await;
        portal.handle_text_message(&message).await;
    }

    async fn handle_media(&self, message: MediaMessage) {
        debug!(
            jid = %message.info.remote_jid,
            message_id = %message.info.id,
            kind = ?message.kind,
            "message: media received"
        );
        let portal = self.portals.get_or_create(&message.info.remote_jid).await;
        self.portals.ensure_room(&portal).await;
        portal.handle_media_message(&message).await;
    }

    async fn handle_image_message(&self, message: ImageMessage) {
        self.handle_media(MediaMessage {
            info: message.info,
            kind: MediaKind::Image,
            media: message.media,
            thumbnail: message.thumbnail,
            caption: non_empty(message.caption),
        })
        .await
    }

    async fn handle_video_message(&self, message: VideoMessage) {
        self.handle_media(MediaMessage {
            info: message.info,
            kind: MediaKind::Video,
            media: message.media,
            thumbnail: message.thumbnail,
            caption: non_empty(message.caption),
        })
        .await
    }

    async fn handle_audio_message(&self, message: AudioMessage) {
        self.handle_media(MediaMessage {
            info: message.info,
            kind: MediaKind::Audio,
            media: message.media,
            thumbnail: None,
            caption: None,
        })
        .await
    }

    async fn handle_document_message(&self, message: DocumentMessage) {
        self.handle_media(MediaMessage {
            info: message.info,
            kind: MediaKind::Document,
            media: message.media,
            thumbnail: message.thumbnail,
            caption: non_empty(message.title),
        })
        .await
    }

    async fn handle_stream_event(&self, stream: StreamEvent) {
        match stream.kind {
            StreamKind::Sleep => {
                self.notify_management_room("WhatsApp client disconnected.")
                    .await;
            }
            StreamKind::Update => {
                let info = match self.connection().await {
                    Some(conn) => conn.info(),
                    None => None,
                };
                if let Some(info) = info.filter(|info| !info.phone.whatsapp_version.is_empty()) {
                    self.notify_management_room(&client_connected_notice(&info.phone))
                        .await;
                }
            }
            StreamKind::Unknown => debug!(version = ?stream.version, "remote: stream event"),
        }
    }

    async fn handle_presence(&self, presence: Presence) {
        let puppet = self.puppets.get_or_create(presence.sender()).await;
        let intent = puppet.intent();
        let result = match presence.status {
            PresenceStatus::Unavailable => {
                puppet.take_typing().await;
                intent.set_presence(PresenceState::Offline).await
            }
            PresenceStatus::Available => match puppet.take_typing().await {
                Some(room) => intent.user_typing(&room, false, Duration::ZERO).await,
                None => intent.set_presence(PresenceState::Online).await,
            },
            PresenceStatus::Composing => {
                let portal = self.portals.get_or_create(&presence.jid).await;
                let Some(room) = portal.room_id().await else {
                    debug!(jid = %presence.jid, "presence: no room linked, ignoring typing");
                    return;
                };
                match puppet.set_typing_in(room.clone()).await {
                    Some(previous) if previous != room => {
                        if let Err(err) = intent.user_typing(&previous, false, Duration::ZERO).await
                        {
                            warn!(room_id = %previous, "presence: failed to clear typing: {err:#}");
                        }
                    }
                    _ => {}
                }
                intent.user_typing(&room, true, TYPING_HINT).await
            }
            PresenceStatus::Paused => {
                debug!(jid = %presence.jid, "presence: paused ignored");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(
                ghost = %puppet.user_id(),
                status = ?presence.status,
                "presence: failed to mirror presence: {err:#}"
            );
        }
    }

    async fn handle_msg_info(&self, info: MsgInfo) {
        if !info.is_read_receipt() {
            return;
        }
        let portal = self.portals.get_or_create(&info.to_jid).await;
        let Some(room) = portal.room_id().await else {
            return;
        };
        let puppet = self.puppets.get_or_create(info.sender()).await;
        let intent = puppet.intent();
        debug!(ids = ?info.ids, room_id = %room, "receipt: read acknowledgement");

        for id in &info.ids {
            let record = match self.ctx.messages.get_by_remote_id(&self.user_id, id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(
                        message_id = %id,
                        kind = %ErrorKind::Reconciliation,
                        "receipt: failed to look up message: {err:#}"
                    );
                    continue;
                }
            };
            if let Err(err) = intent.mark_read(&room, &record.event_id).await {
                warn!(
                    event_id = %record.event_id,
                    reader = %info.sender(),
                    kind = %ErrorKind::Reconciliation,
                    "receipt: failed to mark message as read: {err:#}"
                );
            }
        }
    }
}

/// Registered on the connection; holds the session weakly so a connection
/// that outlives its session does not keep it alive.
struct SessionEventSink {
    session: Weak<UserSession>,
}

#[async_trait]
impl EventHandler for SessionEventSink {
    async fn handle_event(&self, event: RemoteEvent) {
        match self.session.upgrade() {
            Some(session) => session.handle_event(event).await,
            None => debug!(kind = event.kind(), "remote: event for dropped session"),
        }
    }
}

fn client_connected_notice(phone: &PhoneInfo) -> String {
    format!(
        "WhatsApp v{} client connected from {} {} (OS v{}).",
        phone.whatsapp_version, phone.device_manufacturer, phone.device_model, phone.os_version
    )
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
