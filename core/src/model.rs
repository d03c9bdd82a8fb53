use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable subject id handed out by the identity provider for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity(pub String);

impl Identity {
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub external_id: String,
    pub username: String,
    pub image_url: Option<String>,
}

/// Reference to an object in the blob store.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BlobRef(pub Uuid);

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The addressable container a message or typing indicator belongs to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationRef {
    DirectMessage(Uuid),
    Channel(Uuid),
}

impl ConversationRef {
    pub fn id(&self) -> Uuid {
        match self {
            ConversationRef::DirectMessage(id) | ConversationRef::Channel(id) => *id,
        }
    }

    /// Split into the `(dm_id, channel_id)` column pair, exactly one of which is set.
    pub(crate) fn columns(&self) -> (Option<String>, Option<String>) {
        match self {
            ConversationRef::DirectMessage(id) => (Some(id.to_string()), None),
            ConversationRef::Channel(id) => (None, Some(id.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub icon_id: Option<BlobRef>,
    pub default_channel_id: Uuid,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ServerView {
    #[serde(flatten)]
    pub server: Server,
    pub icon_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct CreatedServer {
    pub server_id: Uuid,
    pub default_channel_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Invite {
    pub id: Uuid,
    pub server_id: Uuid,
    pub created_by: Uuid,
    pub expires_at: Option<i64>,
    pub max_uses: Option<u32>,
    pub uses: u32,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct InviteView {
    #[serde(flatten)]
    pub invite: Invite,
    pub server: Server,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct DirectMessageView {
    pub id: Uuid,
    pub created_at: i64,
    pub other_user: User,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation: ConversationRef,
    pub sender_id: Uuid,
    pub content: String,
    pub attachment: Option<BlobRef>,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub sender: User,
    pub attachment_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FriendStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            FriendStatus::Pending => "pending",
            FriendStatus::Accepted => "accepted",
            FriendStatus::Rejected => "rejected",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FriendStatus::Pending),
            "accepted" => Some(FriendStatus::Accepted),
            "rejected" => Some(FriendStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Friend {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub addressee_id: Uuid,
    pub status: FriendStatus,
    pub created_at: i64,
}

/// A friendship row together with the user on the other side of it.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct FriendView {
    #[serde(flatten)]
    pub friend: Friend,
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TypingIndicator {
    pub user_id: Uuid,
    pub conversation: ConversationRef,
    pub expires_at: i64,
}
