//! Newtypes around the opaque identifiers keying each voice connection.

use std::fmt::{Display, Formatter, Result as FmtResult};

macro_rules! impl_id {
    ($Id:ident) => {
        impl $Id {
            /// Wraps an identifier string.
            pub fn new<S: Into<String>>(id: S) -> Self {
                Self(id.into())
            }

            /// Returns the string representation of this Id.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $Id {
            fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
                Display::fmt(&self.0, f)
            }
        }

        impl From<&str> for $Id {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $Id {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<u64> for $Id {
            fn from(id: u64) -> Self {
                Self(id.to_string())
            }
        }
    };
}

/// ID of the bot user owning one side of a voice connection.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct UserId(String);

/// ID of a guild (colloquially, "server") hosting a voice connection.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct GuildId(String);

impl_id!(UserId);
impl_id!(GuildId);

/// Composite identity of one voice connection: a bot user inside a guild.
///
/// At most one live connection exists per `Member` at any time. This is the
/// key under which all lifecycle events are routed.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Member {
    /// ID of the bot account this connection belongs to.
    pub user_id: UserId,
    /// ID of the guild whose voice server is being spoken to.
    pub guild_id: GuildId,
}

impl Member {
    /// Creates a connection key from a user and guild id.
    pub fn new<U, G>(user_id: U, guild_id: G) -> Self
    where
        U: Into<UserId>,
        G: Into<GuildId>,
    {
        Self {
            user_id: user_id.into(),
            guild_id: guild_id.into(),
        }
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}@{}", self.user_id, self.guild_id)
    }
}
