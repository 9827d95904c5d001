use std::{collections::HashMap, sync::Arc};

use shared::{
    domain::{Jid, RoomId, UserId},
    protocol::Contact,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{BridgeConfig, Intent, IntentProvider};

/// Ghost identity that mirrors one remote contact.
pub struct Puppet {
    jid: Jid,
    user_id: UserId,
    intent: Arc<dyn Intent>,
    displayname_template: String,
    displayname: Mutex<Option<String>>,
    typing_in: Mutex<Option<RoomId>>,
}

impl Puppet {
    pub fn jid(&self) -> &Jid {
        &self.jid
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn intent(&self) -> &Arc<dyn Intent> {
        &self.intent
    }

    pub async fn displayname(&self) -> Option<String> {
        self.displayname.lock().await.clone()
    }

    pub async fn typing_in(&self) -> Option<RoomId> {
        self.typing_in.lock().await.clone()
    }

    /// Marks the ghost as typing in `room`, returning the room it was
    /// previously marked in.
    pub async fn set_typing_in(&self, room: RoomId) -> Option<RoomId> {
        self.typing_in.lock().await.replace(room)
    }

    /// Clears and returns the typing mark.
    pub async fn take_typing(&self) -> Option<RoomId> {
        self.typing_in.lock().await.take()
    }

    /// Pushes the contact's display name to the ghost profile when it changed.
    pub async fn sync(&self, contact: &Contact) {
        let source = if !contact.name.is_empty() {
            contact.name.clone()
        } else if !contact.notify.is_empty() {
            contact.notify.clone()
        } else {
            format!("+{}", self.jid.local_part())
        };
        let displayname = self.displayname_template.replace("{}", &source);

        let mut current = self.displayname.lock().await;
        if current.as_deref() == Some(displayname.as_str()) {
            return;
        }
        match self.intent.set_display_name(&displayname).await {
            Ok(()) => {
                debug!(jid = %self.jid, displayname = %displayname, "puppet: display name updated");
                *current = Some(displayname);
            }
            Err(err) => {
                warn!(jid = %self.jid, "puppet: failed to set display name: {err:#}");
            }
        }
    }
}

/// Per-user ghosts keyed by remote contact.
pub struct ContactGhostDirectory {
    config: BridgeConfig,
    intents: Arc<dyn IntentProvider>,
    puppets: Mutex<HashMap<Jid, Arc<Puppet>>>,
}

impl ContactGhostDirectory {
    pub fn new(config: BridgeConfig, intents: Arc<dyn IntentProvider>) -> Self {
        Self {
            config,
            intents,
            puppets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, jid: &Jid) -> Arc<Puppet> {
        let mut puppets = self.puppets.lock().await;
        if let Some(puppet) = puppets.get(jid) {
            return Arc::clone(puppet);
        }
        let user_id = self.config.ghost_user_id(jid);
        let puppet = Arc::new(Puppet {
            jid: jid.clone(),
            intent: self.intents.ghost(&user_id),
            user_id,
            displayname_template: self.config.displayname_template.clone(),
            displayname: Mutex::new(None),
            typing_in: Mutex::new(None),
        });
        puppets.insert(jid.clone(), Arc::clone(&puppet));
        puppet
    }

    pub async fn get(&self, jid: &Jid) -> Option<Arc<Puppet>> {
        self.puppets.lock().await.get(jid).cloned()
    }

    pub async fn len(&self) -> usize {
        self.puppets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
#[path = "tests/puppet_tests.rs"]
mod tests;
