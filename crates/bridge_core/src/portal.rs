use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{Jid, RoomId, UserId},
    protocol::{Contact, MediaSource, MessageInfo, TextMessage},
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::PortalBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

/// Media message after type-specific fields have been normalised.
#[derive(Debug, Clone)]
pub struct MediaMessage {
    pub info: MessageInfo,
    pub kind: MediaKind,
    pub media: MediaSource,
    pub thumbnail: Option<Vec<u8>>,
    /// Caption for images and videos, title for documents.
    pub caption: Option<String>,
}

/// Pairs one remote chat with one room on the federated side.
pub struct Portal {
    jid: Jid,
    owner: UserId,
    room: Mutex<Option<RoomId>>,
    name: RwLock<String>,
    backend: Arc<dyn PortalBackend>,
}

impl Portal {
    fn new(jid: Jid, owner: UserId, backend: Arc<dyn PortalBackend>) -> Self {
        Self {
            jid,
            owner,
            room: Mutex::new(None),
            name: RwLock::new(String::new()),
            backend,
        }
    }

    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    /// The bridged user this portal belongs to.
    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn is_group(&self) -> bool {
        self.jid.is_group()
    }

    pub async fn room_id(&self) -> Option<RoomId> {
        self.room.lock().await.clone()
    }

    pub async fn name(&self) -> String {
        self.name.read().await.clone()
    }

    /// Refreshes chat metadata from the contact list. Returns whether the
    /// name changed.
    pub async fn sync(&self, contact: &Contact) -> bool {
        let name = if !contact.name.is_empty() {
            &contact.name
        } else {
            &contact.notify
        };
        let mut current = self.name.write().await;
        if name.is_empty() || *current == *name {
            return false;
        }
        debug!(jid = %self.jid, name = %name, "portal: name updated");
        *current = name.clone();
        true
    }

    pub async fn handle_text_message(&self, message: &TextMessage) {
        let Some(room) = self.room_id().await else {
            debug!(jid = %self.jid, "portal: no room linked, dropping text message");
            return;
        };
        if let Err(err) = self.backend.relay_text(self, &room, message).await {
            warn!(
                jid = %self.jid,
                message_id = %message.info.id,
                "portal: failed to relay text message: {err:#}"
            );
        }
    }

    pub async fn handle_media_message(&self, message: &MediaMessage) {
        let Some(room) = self.room_id().await else {
            debug!(jid = %self.jid, "portal: no room linked, dropping media message");
            return;
        };
        if let Err(err) = self.backend.relay_media(self, &room, message).await {
            warn!(
                jid = %self.jid,
                message_id = %message.info.id,
                kind = ?message.kind,
                "portal: failed to relay media message: {err:#}"
            );
        }
    }
}

#[derive(Default)]
struct PortalIndex {
    by_jid: HashMap<Jid, Arc<Portal>>,
    by_room: HashMap<RoomId, Arc<Portal>>,
}

/// Per-user portals, looked up by remote chat or by linked room.
pub struct ChatRoomDirectory {
    owner: UserId,
    backend: Arc<dyn PortalBackend>,
    index: Mutex<PortalIndex>,
}

impl ChatRoomDirectory {
    pub fn new(owner: UserId, backend: Arc<dyn PortalBackend>) -> Self {
        Self {
            owner,
            backend,
            index: Mutex::new(PortalIndex::default()),
        }
    }

    pub async fn get_or_create(&self, jid: &Jid) -> Arc<Portal> {
        let mut index = self.index.lock().await;
        if let Some(portal) = index.by_jid.get(jid) {
            return Arc::clone(portal);
        }
        let portal = Arc::new(Portal::new(
            jid.clone(),
            self.owner.clone(),
            Arc::clone(&self.backend),
        ));
        index.by_jid.insert(jid.clone(), Arc::clone(&portal));
        portal
    }

    pub async fn get(&self, jid: &Jid) -> Option<Arc<Portal>> {
        self.index.lock().await.by_jid.get(jid).cloned()
    }

    pub async fn get_by_room(&self, room: &RoomId) -> Option<Arc<Portal>> {
        self.index.lock().await.by_room.get(room).cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.by_jid.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Links `room` to `portal`, replacing any previous link of that portal.
    pub async fn link_room(&self, portal: &Arc<Portal>, room: RoomId) {
        let mut current = portal.room.lock().await;
        self.index_room(portal, current.as_ref(), &room).await;
        *current = Some(room);
    }

    /// Returns the portal's room, asking the backend to create one if none is
    /// linked yet. Concurrent callers for one portal wait for a single creation.
    pub async fn ensure_room(&self, portal: &Arc<Portal>) -> Option<RoomId> {
        let mut current = portal.room.lock().await;
        if let Some(room) = current.as_ref() {
            return Some(room.clone());
        }
        match self.backend.create_room(portal).await {
            Ok(room) => {
                info!(jid = %portal.jid, room_id = %room, "portal: room created");
                self.index_room(portal, None, &room).await;
                *current = Some(room.clone());
                Some(room)
            }
            Err(err) => {
                warn!(jid = %portal.jid, "portal: failed to create room: {err:#}");
                None
            }
        }
    }

    async fn index_room(&self, portal: &Arc<Portal>, previous: Option<&RoomId>, room: &RoomId) {
        let mut index = self.index.lock().await;
        if let Some(previous) = previous {
            index.by_room.remove(previous);
        }
        index.by_room.insert(room.clone(), Arc::clone(portal));
    }
}

#[cfg(test)]
#[path = "tests/portal_tests.rs"]
mod tests;
