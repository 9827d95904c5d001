use std::{collections::HashMap, sync::Arc};

use anyhow::{Context, Result};
use futures::future::join_all;
use shared::domain::{RoomId, UserId};
use storage::UserRecord;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{session::UserSession, BridgeContext};

#[derive(Default)]
struct RegistryState {
    by_user: HashMap<UserId, Arc<UserSession>>,
    by_management_room: HashMap<RoomId, Arc<UserSession>>,
}

impl RegistryState {
    fn register(&mut self, session: Arc<UserSession>, management_room: Option<RoomId>) {
        if let Some(room) = management_room {
            self.by_management_room.insert(room, Arc::clone(&session));
        }
        self.by_user.insert(session.user_id().clone(), session);
    }
}

/// Every resident session, by user and by management room. Built once at
/// startup and shared by reference.
pub struct UserRegistry {
    ctx: BridgeContext,
    state: Mutex<RegistryState>,
}

impl UserRegistry {
    pub fn new(ctx: BridgeContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    /// Returns the resident session for `user_id`, loading or creating its
    /// stored record on first use.
    pub async fn get(self: &Arc<Self>, user_id: &UserId) -> Result<Arc<UserSession>> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.by_user.get(user_id) {
            return Ok(Arc::clone(session));
        }

        let record = match self
            .ctx
            .credentials
            .get_user(user_id)
            .await
            .with_context(|| format!("failed to load user {user_id}"))?
        {
            Some(record) => record,
            None => {
                let record = UserRecord::new(user_id.clone());
                self.ctx
                    .credentials
                    .insert_user(&record)
                    .await
                    .with_context(|| format!("failed to create user {user_id}"))?;
                info!(user_id = %user_id, "registry: created user record");
                record
            }
        };

        let management_room = record.management_room.clone();
        let session = UserSession::new(record, self.ctx.clone(), Arc::downgrade(self));
        state.register(Arc::clone(&session), management_room);
        debug!(user_id = %user_id, "registry: session loaded");
        Ok(session)
    }

    /// One session per stored user, in store order.
    pub async fn get_all(self: &Arc<Self>) -> Result<Vec<Arc<UserSession>>> {
        let records = self
            .ctx
            .credentials
            .all_users()
            .await
            .context("failed to list users")?;

        let mut state = self.state.lock().await;
        let mut sessions = Vec::with_capacity(records.len());
        for record in records {
            if let Some(session) = state.by_user.get(&record.user_id) {
                sessions.push(Arc::clone(session));
                continue;
            }
            let management_room = record.management_room.clone();
            let session = UserSession::new(record, self.ctx.clone(), Arc::downgrade(self));
            state.register(Arc::clone(&session), management_room);
            sessions.push(session);
        }
        Ok(sessions)
    }

    pub async fn get_by_management_room(&self, room: &RoomId) -> Option<Arc<UserSession>> {
        self.state.lock().await.by_management_room.get(room).cloned()
    }

    /// Starts every stored session concurrently.
    pub async fn start_all(self: &Arc<Self>) -> Result<usize> {
        let sessions = self.get_all().await?;
        info!(users = sessions.len(), "registry: starting sessions");
        join_all(sessions.iter().map(|session| session.start())).await;
        Ok(sessions.len())
    }

    /// Moves `room` to `session`. The previous owner of `room` and the
    /// session's previous room are both released under the same lock.
    pub(crate) async fn assign_management_room(&self, session: &Arc<UserSession>, room: RoomId) {
        let mut state = self.state.lock().await;

        if let Some(previous_owner) = state.by_management_room.get(&room).cloned() {
            if !Arc::ptr_eq(&previous_owner, session) {
                debug!(
                    room_id = %room,
                    previous_owner = %previous_owner.user_id(),
                    "registry: management room changes owner"
                );
                previous_owner.replace_management_room(None).await;
            }
        }
        if let Some(old_room) = session.management_room().await {
            if old_room != room {
                state.by_management_room.remove(&old_room);
            }
        }

        session.replace_management_room(Some(room.clone())).await;
        state.by_management_room.insert(room.clone(), Arc::clone(session));
        info!(user_id = %session.user_id(), room_id = %room, "registry: management room set");
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
