use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Jid, RemoteMessageId};

/// Credential issued by the remote network after pairing.
///
/// Opaque to the bridge: it is persisted verbatim and handed back to the
/// connection on restore. The connection may rotate any field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    pub client_id: String,
    pub client_token: String,
    pub server_token: String,
    pub enc_key: Vec<u8>,
    pub mac_key: Vec<u8>,
    pub wid: String,
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredential")
            .field("client_id", &self.client_id)
            .field("wid", &self.wid)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub jid: Jid,
    /// Push name the contact chose; empty until they have messaged us.
    #[serde(default)]
    pub notify: String,
    /// Name from the phone's address book, or the group subject.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub short: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: RemoteMessageId,
    pub remote_jid: Jid,
    /// Participant that sent the message in a group chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_jid: Option<Jid>,
    pub from_me: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub info: MessageInfo,
    pub text: String,
}

/// Lazily fetches and decrypts the body of a media message.
#[async_trait]
pub trait MediaDownload: Send + Sync {
    async fn download(&self) -> anyhow::Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct MediaSource {
    pub mime_type: String,
    pub downloader: Arc<dyn MediaDownload>,
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaSource")
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ImageMessage {
    pub info: MessageInfo,
    pub media: MediaSource,
    pub thumbnail: Option<Vec<u8>>,
    pub caption: String,
}

#[derive(Debug, Clone)]
pub struct VideoMessage {
    pub info: MessageInfo,
    pub media: MediaSource,
    pub thumbnail: Option<Vec<u8>>,
    pub caption: String,
    pub length_secs: u32,
}

#[derive(Debug, Clone)]
pub struct AudioMessage {
    pub info: MessageInfo,
    pub media: MediaSource,
    pub length_secs: u32,
}

#[derive(Debug, Clone)]
pub struct DocumentMessage {
    pub info: MessageInfo,
    pub media: MediaSource,
    pub thumbnail: Option<Vec<u8>>,
    pub title: String,
    pub page_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Unknown,
    Sleep,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: StreamKind,
    #[serde(default)]
    pub version: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneInfo {
    pub whatsapp_version: String,
    pub mcc: String,
    pub mnc: String,
    pub os_version: String,
    pub device_manufacturer: String,
    pub device_model: String,
    pub os_build_number: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    /// Empty when the phone has not reported its client version yet.
    #[serde(default)]
    pub protocol_version: Vec<u32>,
    #[serde(default)]
    pub binary_version: u32,
    #[serde(default)]
    pub phone: PhoneInfo,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub wid: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub connected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Unavailable,
    Available,
    Composing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    /// Chat the presence applies to.
    pub jid: Jid,
    /// Participant inside a group chat; individual chats leave this empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_jid: Option<Jid>,
    pub status: PresenceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Presence {
    pub fn sender(&self) -> &Jid {
        self.sender_jid.as_ref().unwrap_or(&self.jid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgInfoCommand {
    Ack,
    Acks,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acknowledgement {
    Error,
    Pending,
    Sent,
    Delivered,
    Read,
    Played,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgInfo {
    pub command: MsgInfoCommand,
    pub acknowledgement: Acknowledgement,
    pub ids: Vec<RemoteMessageId>,
    pub from_jid: Jid,
    pub to_jid: Jid,
    /// Who produced the acknowledgement; falls back to `from_jid`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_jid: Option<Jid>,
}

impl MsgInfo {
    pub fn is_read_receipt(&self) -> bool {
        matches!(self.command, MsgInfoCommand::Ack | MsgInfoCommand::Acks)
            && self.acknowledgement == Acknowledgement::Read
    }

    pub fn sender(&self) -> &Jid {
        self.sender_jid.as_ref().unwrap_or(&self.from_jid)
    }
}

/// Everything a remote connection can push to its registered handler.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    Error(String),
    JsonParseError(String),
    Json(String),
    Text(TextMessage),
    Image(ImageMessage),
    Video(VideoMessage),
    Audio(AudioMessage),
    Document(DocumentMessage),
    Stream(StreamEvent),
    ConnInfo(ConnInfo),
    Presence(Presence),
    MsgInfo(MsgInfo),
}

impl RemoteEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::JsonParseError(_) => "json_parse_error",
            Self::Json(_) => "json",
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Video(_) => "video",
            Self::Audio(_) => "audio",
            Self::Document(_) => "document",
            Self::Stream(_) => "stream",
            Self::ConnInfo(_) => "conn_info",
            Self::Presence(_) => "presence",
            Self::MsgInfo(_) => "msg_info",
        }
    }
}
