//! Bot commands accepted from bridged users.
//!
//! Inside a user's management room every message is a command. Anywhere else
//! a message must start with the configured prefix (`!wa` by default).

use std::sync::Arc;

use anyhow::Result;
use shared::domain::{RoomId, UserId};
use tracing::{debug, warn};

use crate::{
    registry::UserRegistry,
    session::{ConnectionState, UserSession},
};

pub const HELP_TEXT: &str = "Available commands:\n\
    help - show this message\n\
    login - link a WhatsApp account by scanning a QR code\n\
    logout - unlink the WhatsApp account\n\
    reconnect - reopen the WhatsApp connection\n\
    sync - synchronize contacts and chats\n\
    ping - show the connection state\n\
    set-management-room - use this room for bridge notices";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Login,
    Logout,
    Reconnect,
    Sync,
    Ping,
    SetManagementRoom,
    Unknown(String),
}

impl Command {
    fn from_word(word: &str) -> Self {
        match word.to_ascii_lowercase().as_str() {
            "help" => Self::Help,
            "login" => Self::Login,
            "logout" => Self::Logout,
            "reconnect" => Self::Reconnect,
            "sync" => Self::Sync,
            "ping" => Self::Ping,
            "set-management-room" => Self::SetManagementRoom,
            _ => Self::Unknown(word.to_string()),
        }
    }
}

/// Extracts a command from a message body, or `None` when the message is not
/// addressed to the bot.
pub fn parse_command(body: &str, in_management_room: bool, prefix: &str) -> Option<Command> {
    let body = body.trim();
    let rest = match body.strip_prefix(prefix) {
        Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => rest,
        _ if in_management_room => body,
        _ => return None,
    };
    Some(match rest.split_whitespace().next() {
        Some(word) => Command::from_word(word),
        None => Command::Help,
    })
}

/// Runs the command in `body`, if any. Returns whether the message was a
/// command.
///
/// `login` waits for the pairing to finish, so callers on a shared event loop
/// should run this on its own task.
pub async fn handle_command(
    registry: &Arc<UserRegistry>,
    sender: &UserId,
    room: &RoomId,
    body: &str,
) -> Result<bool> {
    let session = registry.get(sender).await?;
    let management_room = session.management_room().await;
    let in_management_room = management_room.as_ref() == Some(room);
    let prefix = &registry.context().config.command_prefix;

    let Some(command) = parse_command(body, in_management_room, prefix) else {
        return Ok(false);
    };
    debug!(user_id = %sender, room_id = %room, command = ?command, "command: received");

    let reply = |text: String| {
        let bot = registry.context().intents.bot();
        let room = room.clone();
        async move {
            if let Err(err) = bot.send_notice(&room, &text).await {
                warn!(room_id = %room, "command: failed to send reply: {err:#}");
            }
        }
    };

    match command {
        Command::Help => reply(HELP_TEXT.to_string()).await,
        Command::Login => login(&session, room, &reply).await,
        Command::Logout => {
            let had_session = session.logout().await;
            if !had_session {
                reply("You weren't logged in.".to_string()).await;
            } else if !in_management_room {
                reply("Logged out of WhatsApp.".to_string()).await;
            }
        }
        Command::Reconnect => {
            session.disconnect().await;
            if session.connect(false).await {
                reply("Reconnected to WhatsApp.".to_string()).await;
            } else if session.has_session().await {
                reply("Failed to reconnect; see logs for details.".to_string()).await;
            } else {
                reply("You're not logged in. Use `login` first.".to_string()).await;
            }
        }
        Command::Sync => {
            if session.state().await != ConnectionState::LoggedIn {
                reply("You're not logged in.".to_string()).await;
            } else {
                session.sync().await;
                reply("Synchronization complete.".to_string()).await;
            }
        }
        Command::Ping => reply(ping_text(&session).await).await,
        Command::SetManagementRoom => {
            session.set_management_room(room.clone()).await;
            reply("Management room updated.".to_string()).await;
        }
        Command::Unknown(word) => {
            reply(format!("Unknown command `{word}`. Use `help` for a list of commands.")).await;
        }
    }
    Ok(true)
}

async fn login<F, Fut>(session: &Arc<UserSession>, room: &RoomId, reply: &F)
where
    F: Fn(String) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    if session.state().await == ConnectionState::LoggedIn {
        reply("You're already logged in.".to_string()).await;
        return;
    }
    if !session.connect(true).await && !session.is_connected().await {
        reply("Failed to connect to WhatsApp; see logs for details.".to_string()).await;
        return;
    }
    if session.state().await == ConnectionState::LoggedIn {
        reply("Restored the existing WhatsApp session.".to_string()).await;
        return;
    }
    session.login(room).await;
}

async fn ping_text(session: &UserSession) -> String {
    match session.state().await {
        ConnectionState::LoggedIn => "Logged in and connected to WhatsApp.".to_string(),
        ConnectionState::Connected => {
            let failures = session.restore_failures();
            if failures > 0 {
                format!("Connected but not logged in ({failures} failed restore attempts).")
            } else {
                "Connected but not logged in.".to_string()
            }
        }
        ConnectionState::Connecting | ConnectionState::Restoring => {
            "Connecting to WhatsApp...".to_string()
        }
        ConnectionState::Disconnected => {
            if session.has_session().await {
                "Logged in but not connected. Use `reconnect`.".to_string()
            } else {
                "You're not logged in.".to_string()
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
