use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

// Federated chat side.
id_newtype!(UserId);
id_newtype!(RoomId);
id_newtype!(EventId);
id_newtype!(ContentUri);

// Remote network side.
id_newtype!(Jid);
id_newtype!(RemoteMessageId);

pub const USER_JID_SUFFIX: &str = "@s.whatsapp.net";
pub const GROUP_JID_SUFFIX: &str = "@g.us";

impl Jid {
    /// Individual contacts live in the `@s.whatsapp.net` namespace.
    pub fn is_user(&self) -> bool {
        self.0.ends_with(USER_JID_SUFFIX)
    }

    pub fn is_group(&self) -> bool {
        self.0.ends_with(GROUP_JID_SUFFIX)
    }

    /// The part before `@`, i.e. the phone number for individual contacts.
    pub fn local_part(&self) -> &str {
        self.0
            .split_once('@')
            .map_or(self.0.as_str(), |(local, _)| local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    Online,
    Offline,
    Unavailable,
}

impl PresenceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unavailable => "unavailable",
        }
    }
}
