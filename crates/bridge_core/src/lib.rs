use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{ContentUri, EventId, Jid, PresenceState, RoomId, UserId},
    protocol::{ConnInfo, Contact, RemoteEvent, SessionCredential, TextMessage},
};
use storage::{CredentialStore, MessageStore};
use tokio::sync::mpsc;

pub mod commands;
pub mod error;
pub mod homeserver;
mod pairing;
pub mod portal;
pub mod puppet;
pub mod registry;
pub mod session;

pub use error::{PairingError, SessionError};
pub use pairing::encode_qr_png;
pub use portal::{ChatRoomDirectory, MediaKind, MediaMessage, Portal};
pub use puppet::{ContactGhostDirectory, Puppet};
pub use registry::UserRegistry;
pub use session::{ConnectionState, UserSession};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// How long a start-typing signal stays valid unless refreshed.
pub const TYPING_HINT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Server name used when building ghost user ids.
    pub homeserver_domain: String,
    /// Ghost localpart; `{}` is replaced with the contact's phone number.
    pub username_template: String,
    /// Ghost display name; `{}` is replaced with the contact's name.
    pub displayname_template: String,
    pub connect_timeout: Duration,
    /// Prefix for commands sent outside the management room.
    pub command_prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            homeserver_domain: "localhost".into(),
            username_template: "whatsapp_{}".into(),
            displayname_template: "{} (WhatsApp)".into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_prefix: "!wa".into(),
        }
    }
}

impl BridgeConfig {
    pub fn ghost_user_id(&self, jid: &Jid) -> UserId {
        let localpart = self.username_template.replace("{}", jid.local_part());
        UserId(format!("@{localpart}:{}", self.homeserver_domain))
    }
}

/// Opens live sessions to the remote network.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self, timeout: Duration) -> Result<Arc<dyn RemoteConnection>>;
}

/// One live session to the remote network.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    fn add_handler(&self, handler: Arc<dyn EventHandler>);
    async fn restore_session(&self, session: SessionCredential) -> Result<SessionCredential>;
    /// Blocks until pairing completes or fails. Pairing codes are pushed into
    /// `codes` (possibly several, as they rotate) while waiting for a scan.
    async fn login(&self, codes: mpsc::Sender<String>) -> Result<SessionCredential>;
    async fn contacts(&self) -> Result<Vec<Contact>>;
    /// Last connection info reported by the phone.
    fn info(&self) -> Option<ConnInfo>;
    async fn logout(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
}

/// Receives everything a [`RemoteConnection`] pushes.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: RemoteEvent);
}

/// Acts on the federated chat network as one user (the bridge bot or a ghost).
#[async_trait]
pub trait Intent: Send + Sync {
    fn user_id(&self) -> &UserId;
    async fn send_notice(&self, room: &RoomId, text: &str) -> Result<EventId>;
    async fn send_image(&self, room: &RoomId, alt_text: &str, media: &ContentUri)
        -> Result<EventId>;
    async fn upload_bytes(&self, bytes: Vec<u8>, mime_type: &str) -> Result<ContentUri>;
    async fn set_presence(&self, state: PresenceState) -> Result<()>;
    async fn user_typing(&self, room: &RoomId, typing: bool, timeout: Duration) -> Result<()>;
    async fn mark_read(&self, room: &RoomId, event: &EventId) -> Result<()>;
    async fn set_display_name(&self, name: &str) -> Result<()>;
}

pub trait IntentProvider: Send + Sync {
    fn bot(&self) -> Arc<dyn Intent>;
    fn ghost(&self, user_id: &UserId) -> Arc<dyn Intent>;
}

/// Room creation and message relaying for portals.
#[async_trait]
pub trait PortalBackend: Send + Sync {
    /// Runs while the portal's room slot is locked, so it must not call
    /// [`Portal::room_id`].
    async fn create_room(&self, portal: &Portal) -> Result<RoomId>;
    async fn relay_text(&self, portal: &Portal, room: &RoomId, message: &TextMessage)
        -> Result<()>;
    async fn relay_media(&self, portal: &Portal, room: &RoomId, message: &MediaMessage)
        -> Result<()>;
}

pub struct MissingRemoteConnector;

#[async_trait]
impl RemoteConnector for MissingRemoteConnector {
    async fn connect(&self, _timeout: Duration) -> Result<Arc<dyn RemoteConnection>> {
        Err(anyhow!("remote connector is unavailable"))
    }
}

pub struct MissingPortalBackend;

#[async_trait]
impl PortalBackend for MissingPortalBackend {
    async fn create_room(&self, portal: &Portal) -> Result<RoomId> {
        Err(anyhow!(
            "portal backend unavailable; cannot create room for {}",
            portal.jid()
        ))
    }

    async fn relay_text(
        &self,
        portal: &Portal,
        _room: &RoomId,
        _message: &TextMessage,
    ) -> Result<()> {
        Err(anyhow!(
            "portal backend unavailable; dropping text for {}",
            portal.jid()
        ))
    }

    async fn relay_media(
        &self,
        portal: &Portal,
        _room: &RoomId,
        _message: &MediaMessage,
    ) -> Result<()> {
        Err(anyhow!(
            "portal backend unavailable; dropping media for {}",
            portal.jid()
        ))
    }
}

/// Collaborators shared by every session in the process.
#[derive(Clone)]
pub struct BridgeContext {
    pub config: BridgeConfig,
    pub credentials: Arc<dyn CredentialStore>,
    pub messages: Arc<dyn MessageStore>,
    pub connector: Arc<dyn RemoteConnector>,
    pub intents: Arc<dyn IntentProvider>,
    pub portals: Arc<dyn PortalBackend>,
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
