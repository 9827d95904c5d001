use std::{
    collections::HashSet,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{ContentUri, EventId, Jid, PresenceState, RemoteMessageId, RoomId, UserId},
    protocol::{
        ConnInfo, Contact, MediaDownload, MediaSource, MessageInfo, RemoteEvent,
        SessionCredential, TextMessage,
    },
};
use storage::{CredentialStore, MessageRecord, MessageStore, Storage, UserRecord};
use tokio::sync::{mpsc, Mutex};

use crate::{
    registry::UserRegistry, BridgeConfig, BridgeContext, EventHandler, Intent, IntentProvider,
    MediaKind, MediaMessage, Portal, PortalBackend, RemoteConnection, RemoteConnector,
};

pub(crate) const BOT: &str = "@whatsappbot:example.org";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum IntentCall {
    Notice { room: RoomId, text: String },
    Image { room: RoomId, alt_text: String, media: ContentUri },
    Upload { mime_type: String, size: usize },
    Presence(PresenceState),
    Typing { room: RoomId, typing: bool, timeout: Duration },
    MarkRead { room: RoomId, event: EventId },
    DisplayName(String),
}

#[derive(Default)]
struct FailurePlan {
    upload: bool,
    mark_read: HashSet<EventId>,
}

type CallLog = Arc<Mutex<Vec<(UserId, IntentCall)>>>;

struct RecordingIntent {
    user_id: UserId,
    log: CallLog,
    plan: Arc<FailurePlan>,
}

impl RecordingIntent {
    async fn record(&self, call: IntentCall) {
        self.log.lock().await.push((self.user_id.clone(), call));
    }
}

#[async_trait]
impl Intent for RecordingIntent {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn send_notice(&self, room: &RoomId, text: &str) -> Result<EventId> {
        self.record(IntentCall::Notice {
            room: room.clone(),
            text: text.to_string(),
        })
        .await;
        Ok(EventId::from("$notice"))
    }

    async fn send_image(
        &self,
        room: &RoomId,
        alt_text: &str,
        media: &ContentUri,
    ) -> Result<EventId> {
        self.record(IntentCall::Image {
            room: room.clone(),
            alt_text: alt_text.to_string(),
            media: media.clone(),
        })
        .await;
        Ok(EventId::from("$image"))
    }

    async fn upload_bytes(&self, bytes: Vec<u8>, mime_type: &str) -> Result<ContentUri> {
        self.record(IntentCall::Upload {
            mime_type: mime_type.to_string(),
            size: bytes.len(),
        })
        .await;
        if self.plan.upload {
            return Err(anyhow!("media repository unavailable"));
        }
        Ok(ContentUri::from("mxc://example.org/qr"))
    }

    async fn set_presence(&self, state: PresenceState) -> Result<()> {
        self.record(IntentCall::Presence(state)).await;
        Ok(())
    }

    async fn user_typing(&self, room: &RoomId, typing: bool, timeout: Duration) -> Result<()> {
        self.record(IntentCall::Typing {
            room: room.clone(),
            typing,
            timeout,
        })
        .await;
        Ok(())
    }

    async fn mark_read(&self, room: &RoomId, event: &EventId) -> Result<()> {
        self.record(IntentCall::MarkRead {
            room: room.clone(),
            event: event.clone(),
        })
        .await;
        if self.plan.mark_read.contains(event) {
            return Err(anyhow!("receipt rejected for {event}"));
        }
        Ok(())
    }

    async fn set_display_name(&self, name: &str) -> Result<()> {
        self.record(IntentCall::DisplayName(name.to_string())).await;
        Ok(())
    }
}

pub(crate) struct RecordingIntentProvider {
    log: CallLog,
    plan: Arc<FailurePlan>,
}

impl RecordingIntentProvider {
    pub(crate) fn new() -> Self {
        Self::with_plan(FailurePlan::default())
    }

    pub(crate) fn failing_upload() -> Self {
        Self::with_plan(FailurePlan {
            upload: true,
            ..FailurePlan::default()
        })
    }

    pub(crate) fn failing_mark_read(events: &[&str]) -> Self {
        Self::with_plan(FailurePlan {
            mark_read: events.iter().map(|event| EventId::from(*event)).collect(),
            ..FailurePlan::default()
        })
    }

    fn with_plan(plan: FailurePlan) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            plan: Arc::new(plan),
        }
    }

    pub(crate) async fn calls(&self) -> Vec<(UserId, IntentCall)> {
        self.log.lock().await.clone()
    }

    pub(crate) async fn calls_by(&self, user_id: &str) -> Vec<IntentCall> {
        self.log
            .lock()
            .await
            .iter()
            .filter(|(who, _)| who.as_str() == user_id)
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub(crate) async fn notices(&self) -> Vec<(RoomId, String)> {
        self.calls_by(BOT)
            .await
            .into_iter()
            .filter_map(|call| match call {
                IntentCall::Notice { room, text } => Some((room, text)),
                _ => None,
            })
            .collect()
    }
}

impl IntentProvider for RecordingIntentProvider {
    fn bot(&self) -> Arc<dyn Intent> {
        self.ghost(&UserId::from(BOT))
    }

    fn ghost(&self, user_id: &UserId) -> Arc<dyn Intent> {
        Arc::new(RecordingIntent {
            user_id: user_id.clone(),
            log: Arc::clone(&self.log),
            plan: Arc::clone(&self.plan),
        })
    }
}

pub(crate) struct FakeConnection {
    handlers: std::sync::Mutex<Vec<Arc<dyn EventHandler>>>,
    restore_error: Option<String>,
    rotated: Option<SessionCredential>,
    login_codes: Vec<String>,
    login_result: std::result::Result<SessionCredential, String>,
    contacts: Vec<Contact>,
    info: Option<ConnInfo>,
    code_sender: Mutex<Option<mpsc::Sender<String>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FakeConnection {
    pub(crate) fn new() -> Self {
        Self {
            handlers: std::sync::Mutex::new(Vec::new()),
            restore_error: None,
            rotated: None,
            login_codes: Vec::new(),
            login_result: Ok(credential("paired")),
            contacts: Vec::new(),
            info: None,
            code_sender: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_restore_error(mut self, err: &str) -> Self {
        self.restore_error = Some(err.to_string());
        self
    }

    pub(crate) fn with_rotated_credential(mut self, rotated: SessionCredential) -> Self {
        self.rotated = Some(rotated);
        self
    }

    pub(crate) fn with_login_codes(mut self, codes: &[&str]) -> Self {
        self.login_codes = codes.iter().map(|code| code.to_string()).collect();
        self
    }

    pub(crate) fn with_login_error(mut self, err: &str) -> Self {
        self.login_result = Err(err.to_string());
        self
    }

    pub(crate) fn with_contacts(mut self, contacts: Vec<Contact>) -> Self {
        self.contacts = contacts;
        self
    }

    pub(crate) fn with_info(mut self, info: ConnInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.lock().map(|handlers| handlers.len()).unwrap_or(0)
    }

    /// Delivers `event` to every registered handler, as the remote library
    /// would.
    pub(crate) async fn emit(&self, event: RemoteEvent) {
        let handlers = self
            .handlers
            .lock()
            .map(|handlers| handlers.clone())
            .unwrap_or_default();
        for handler in handlers {
            handler.handle_event(event.clone()).await;
        }
    }

    /// The code channel handed to the last `login` call.
    pub(crate) async fn code_sender(&self) -> Option<mpsc::Sender<String>> {
        self.code_sender.lock().await.clone()
    }

    pub(crate) async fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.push(handler);
        }
    }

    async fn restore_session(&self, session: SessionCredential) -> Result<SessionCredential> {
        self.calls.lock().await.push("restore_session");
        if let Some(err) = &self.restore_error {
            return Err(anyhow!(err.clone()));
        }
        Ok(self.rotated.clone().unwrap_or(session))
    }

    async fn login(&self, codes: mpsc::Sender<String>) -> Result<SessionCredential> {
        self.calls.lock().await.push("login");
        *self.code_sender.lock().await = Some(codes.clone());
        for code in &self.login_codes {
            codes.send(code.clone()).await?;
        }
        self.login_result.clone().map_err(|err| anyhow!(err))
    }

    async fn contacts(&self) -> Result<Vec<Contact>> {
        self.calls.lock().await.push("contacts");
        Ok(self.contacts.clone())
    }

    fn info(&self) -> Option<ConnInfo> {
        self.info.clone()
    }

    async fn logout(&self) -> Result<()> {
        self.calls.lock().await.push("logout");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.calls.lock().await.push("disconnect");
        Ok(())
    }
}

pub(crate) struct FakeConnector {
    connection: Arc<FakeConnection>,
    fail_with: Option<String>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new(connection: Arc<FakeConnection>) -> Self {
        Self {
            connection,
            fail_with: None,
            connects: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing(err: &str) -> Self {
        Self {
            fail_with: Some(err.to_string()),
            ..Self::new(Arc::new(FakeConnection::new()))
        }
    }

    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, _timeout: Duration) -> Result<Arc<dyn RemoteConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        Ok(self.connection.clone())
    }
}

#[derive(Default)]
pub(crate) struct RecordingPortalBackend {
    pub(crate) created: Mutex<Vec<Jid>>,
    pub(crate) texts: Mutex<Vec<(RoomId, String)>>,
    pub(crate) media: Mutex<Vec<(RoomId, MediaKind, Option<String>, bool)>>,
    pub(crate) fail_create: bool,
}

impl RecordingPortalBackend {
    pub(crate) fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }
}

pub(crate) fn room_for(jid: &str) -> RoomId {
    let local = jid.split_once('@').map_or(jid, |(local, _)| local);
    RoomId(format!("!room-{local}:example.org"))
}

#[async_trait]
impl PortalBackend for RecordingPortalBackend {
    async fn create_room(&self, portal: &Portal) -> Result<RoomId> {
        if self.fail_create {
            return Err(anyhow!("room creation disabled"));
        }
        self.created.lock().await.push(portal.jid().clone());
        Ok(room_for(portal.jid().as_str()))
    }

    async fn relay_text(&self, _portal: &Portal, room: &RoomId, message: &TextMessage) -> Result<()> {
        self.texts
            .lock()
            .await
            .push((room.clone(), message.text.clone()));
        Ok(())
    }

    async fn relay_media(
        &self,
        _portal: &Portal,
        room: &RoomId,
        message: &MediaMessage,
    ) -> Result<()> {
        self.media.lock().await.push((
            room.clone(),
            message.kind,
            message.caption.clone(),
            message.thumbnail.is_some(),
        ));
        Ok(())
    }
}

/// One bridge process wired to fakes and an in-memory database.
pub(crate) struct Harness {
    pub(crate) ctx: BridgeContext,
    pub(crate) storage: Arc<Storage>,
    pub(crate) intents: Arc<RecordingIntentProvider>,
    pub(crate) connection: Arc<FakeConnection>,
    pub(crate) connector: Arc<FakeConnector>,
    pub(crate) backend: Arc<RecordingPortalBackend>,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        Self::build(FakeConnection::new(), RecordingIntentProvider::new(), None).await
    }

    pub(crate) async fn with_connection(connection: FakeConnection) -> Self {
        Self::build(connection, RecordingIntentProvider::new(), None).await
    }

    pub(crate) async fn build(
        connection: FakeConnection,
        intents: RecordingIntentProvider,
        connector: Option<FakeConnector>,
    ) -> Self {
        let storage = Arc::new(
            Storage::new("sqlite::memory:")
                .await
                .expect("in-memory storage"),
        );
        let connection = Arc::new(connection);
        let connector =
            Arc::new(connector.unwrap_or_else(|| FakeConnector::new(Arc::clone(&connection))));
        let intents = Arc::new(intents);
        let backend = Arc::new(RecordingPortalBackend::default());
        let ctx = BridgeContext {
            config: BridgeConfig {
                homeserver_domain: "example.org".into(),
                ..BridgeConfig::default()
            },
            credentials: storage.clone(),
            messages: storage.clone(),
            connector: connector.clone(),
            intents: intents.clone(),
            portals: backend.clone(),
        };
        Self {
            ctx,
            storage,
            intents,
            connection,
            connector,
            backend,
        }
    }

    pub(crate) fn registry(&self) -> Arc<UserRegistry> {
        UserRegistry::new(self.ctx.clone())
    }

    pub(crate) async fn seed_user(&self, user_id: &str, session: Option<SessionCredential>) {
        let record = UserRecord {
            user_id: UserId::from(user_id),
            session,
            management_room: None,
        };
        self.storage.insert_user(&record).await.expect("seed user");
    }

    pub(crate) async fn seed_message(&self, user_id: &str, remote_id: &str, room: &RoomId, event: &str) {
        self.storage
            .insert_message(&MessageRecord {
                user_id: UserId::from(user_id),
                remote_id: RemoteMessageId::from(remote_id),
                room_id: room.clone(),
                event_id: EventId::from(event),
            })
            .await
            .expect("seed message");
    }

    pub(crate) async fn stored_session(&self, user_id: &str) -> Option<SessionCredential> {
        self.storage
            .get_user(&UserId::from(user_id))
            .await
            .expect("load user")
            .and_then(|record| record.session)
    }
}

pub(crate) fn credential(tag: &str) -> SessionCredential {
    SessionCredential {
        client_id: format!("client-{tag}"),
        client_token: format!("client-token-{tag}"),
        server_token: format!("server-token-{tag}"),
        enc_key: vec![1; 32],
        mac_key: vec![2; 32],
        wid: "15550001111@s.whatsapp.net".into(),
    }
}

pub(crate) fn contact(jid: &str, notify: &str, name: &str) -> Contact {
    Contact {
        jid: Jid::from(jid),
        notify: notify.to_string(),
        name: name.to_string(),
        short: String::new(),
    }
}

pub(crate) fn message_info(id: &str, chat: &str) -> MessageInfo {
    MessageInfo {
        id: RemoteMessageId::from(id),
        remote_jid: Jid::from(chat),
        sender_jid: None,
        from_me: false,
        timestamp: Utc::now(),
        push_name: None,
    }
}

struct StaticDownload;

#[async_trait]
impl MediaDownload for StaticDownload {
    async fn download(&self) -> Result<Vec<u8>> {
        Ok(b"media".to_vec())
    }
}

pub(crate) fn media_source(mime_type: &str) -> MediaSource {
    MediaSource {
        mime_type: mime_type.to_string(),
        downloader: Arc::new(StaticDownload),
    }
}

/// Polls `condition` until it holds or two seconds pass.
pub(crate) async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
