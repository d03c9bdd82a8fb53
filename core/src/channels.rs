pub use crate::model::Channel;
use crate::db::uuid_at;
use crate::error::{on_conflict, ChatError, Result};
use crate::guard;
use crate::model::{BlobRef, User};
use crate::servers;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// Normalize a channel name: lowercase ASCII alphanumerics separated by
/// single dashes.
pub fn normalize_name(input: &str) -> String {
    let mut name = String::new();
    let mut prev_dash = false;
    for c in input.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
            prev_dash = false;
        } else if !prev_dash {
            name.push('-');
            prev_dash = true;
        }
    }
    name.trim_matches('-').to_string()
}

fn row_to_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: uuid_at(row, 0)?,
        server_id: uuid_at(row, 1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub fn find(conn: &Connection, id: &Uuid) -> Result<Option<Channel>> {
    let channel = conn
        .query_row(
            "SELECT id, server_id, name, created_at FROM channels WHERE id = ?1",
            [id.to_string()],
            row_to_channel,
        )
        .optional()?;
    Ok(channel)
}

pub fn list(conn: &Connection, caller: &User, server_id: &Uuid) -> Result<Vec<Channel>> {
    guard::assert_server_member(conn, caller, server_id)?;
    let mut stmt = conn.prepare(
        "SELECT id, server_id, name, created_at FROM channels WHERE server_id = ?1 ORDER BY created_at, name",
    )?;
    let channels = stmt
        .query_map([server_id.to_string()], row_to_channel)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(channels)
}

pub fn get(conn: &Connection, caller: &User, id: &Uuid) -> Result<Channel> {
    guard::assert_channel_member(conn, caller, id)
}

/// Create a channel in a server the caller owns.
pub fn create(
    conn: &Connection,
    caller: &User,
    server_id: &Uuid,
    name: &str,
    now: i64,
) -> Result<Channel> {
    guard::assert_server_owner(conn, caller, server_id)?;
    let name = normalize_name(name);
    if name.is_empty() {
        return Err(ChatError::InvalidInput("channel name is empty"));
    }
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO channels (id, server_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id.to_string(), server_id.to_string(), name, now],
    )
    .map_err(|e| on_conflict(e, "channel"))?;
    Ok(Channel {
        id,
        server_id: *server_id,
        name,
        created_at: now,
    })
}

/// Outcome of deleting a channel: the attachments its messages referenced
/// still have to be released from the blob store.
#[derive(Debug)]
pub struct RemovedChannel {
    pub channel: Channel,
    pub attachments: Vec<BlobRef>,
}

/// Delete a channel along with its messages and typing indicators.
///
/// The default channel is refused before ownership is looked at, so it can
/// never be deleted by anyone.
pub fn remove(conn: &Connection, caller: &User, id: &Uuid) -> Result<RemovedChannel> {
    let channel = find(conn, id)?.ok_or(ChatError::NotFound("channel"))?;
    let server = servers::find(conn, &channel.server_id)?.ok_or(ChatError::NotFound("server"))?;
    if server.default_channel_id == channel.id {
        return Err(ChatError::CannotDeleteDefaultChannel);
    }
    if server.owner_id != caller.id {
        return Err(ChatError::NotOwner);
    }
    let mut stmt = conn.prepare(
        "SELECT attachment_id FROM messages WHERE channel_id = ?1 AND attachment_id IS NOT NULL",
    )?;
    let attachments = stmt
        .query_map([id.to_string()], |row| uuid_at(row, 0).map(BlobRef))?
        .collect::<Result<Vec<_>, _>>()?;
    conn.execute("DELETE FROM channels WHERE id = ?1", [id.to_string()])?;
    Ok(RemovedChannel {
        channel,
        attachments,
    })
}
