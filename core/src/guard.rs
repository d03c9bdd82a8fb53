//! Membership and ownership checks gating every conversation or server
//! scoped operation.
//!
//! Checks are read-only and fail closed. They run on the same connection
//! (usually an open transaction) as the operation they protect.

use crate::error::{ChatError, Result};
use crate::model::{Channel, ConversationRef, Identity, Server, User};
use crate::{channels, servers, users};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// Resolve the caller's user record from their identity.
pub fn resolve_caller(conn: &Connection, identity: &Identity) -> Result<User> {
    users::current(conn, identity)
}

pub fn is_server_member(conn: &Connection, user_id: &Uuid, server_id: &Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM server_members WHERE server_id = ?1 AND user_id = ?2",
            params![server_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn is_dm_member(conn: &Connection, user_id: &Uuid, dm_id: &Uuid) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM dm_members WHERE dm_id = ?1 AND user_id = ?2",
            params![dm_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn assert_server_member(conn: &Connection, caller: &User, server_id: &Uuid) -> Result<Server> {
    let server = servers::find(conn, server_id)?.ok_or(ChatError::NotFound("server"))?;
    if !is_server_member(conn, &caller.id, server_id)? {
        return Err(ChatError::NotAMember);
    }
    Ok(server)
}

/// Stricter check for owner-only actions: creating or deleting channels and
/// managing invites.
pub fn assert_server_owner(conn: &Connection, caller: &User, server_id: &Uuid) -> Result<Server> {
    let server = servers::find(conn, server_id)?.ok_or(ChatError::NotFound("server"))?;
    if server.owner_id != caller.id {
        return Err(ChatError::NotOwner);
    }
    Ok(server)
}

/// A channel is reachable through a membership of the server that owns it.
pub fn assert_channel_member(
    conn: &Connection,
    caller: &User,
    channel_id: &Uuid,
) -> Result<Channel> {
    let channel = channels::find(conn, channel_id)?.ok_or(ChatError::NotFound("channel"))?;
    assert_server_member(conn, caller, &channel.server_id)?;
    Ok(channel)
}

pub fn assert_dm_member(conn: &Connection, caller: &User, dm_id: &Uuid) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM direct_messages WHERE id = ?1",
            [dm_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(ChatError::NotFound("direct message"));
    }
    if !is_dm_member(conn, &caller.id, dm_id)? {
        return Err(ChatError::NotAMember);
    }
    Ok(())
}

pub fn assert_conversation_member(
    conn: &Connection,
    caller: &User,
    conversation: ConversationRef,
) -> Result<()> {
    match conversation {
        ConversationRef::DirectMessage(dm_id) => assert_dm_member(conn, caller, &dm_id),
        ConversationRef::Channel(channel_id) => {
            assert_channel_member(conn, caller, &channel_id).map(|_| ())
        }
    }
}
