use crate::db::uuid_at;
use crate::error::{on_conflict, ChatError, Result};
use crate::model::{Identity, User};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

static HANDLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{2,32}$").expect("handle pattern"));

pub(crate) const USER_COLUMNS: &str = "id, external_id, username, image_url";

pub(crate) fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, 0)?,
        external_id: row.get(1)?,
        username: row.get(2)?,
        image_url: row.get(3)?,
    })
}

pub fn is_valid_handle(handle: &str) -> bool {
    HANDLE_RE.is_match(handle)
}

pub fn get_by_external_id(conn: &Connection, external_id: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE external_id = ?1"),
            [external_id],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub fn get_by_id(conn: &Connection, id: &Uuid) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            [id.to_string()],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

pub fn get_by_username(conn: &Connection, username: &str) -> Result<Option<User>> {
    let user = conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
            [username],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

/// The signed-in user behind an identity.
pub fn current(conn: &Connection, identity: &Identity) -> Result<User> {
    get_by_external_id(conn, identity.as_str())?.ok_or(ChatError::Unauthorized)
}

/// Create or update the user for an identity provider subject.
pub fn upsert(
    conn: &Connection,
    external_id: &str,
    username: &str,
    image_url: Option<&str>,
) -> Result<User> {
    if external_id.is_empty() {
        return Err(ChatError::InvalidInput("missing subject id"));
    }
    if !is_valid_handle(username) {
        return Err(ChatError::InvalidInput("invalid username"));
    }
    let id = match get_by_external_id(conn, external_id)? {
        Some(existing) => {
            conn.execute(
                "UPDATE users SET username = ?2, image_url = ?3 WHERE id = ?1",
                params![existing.id.to_string(), username, image_url],
            )
            .map_err(|e| on_conflict(e, "username"))?;
            existing.id
        }
        None => {
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO users (id, external_id, username, image_url) VALUES (?1, ?2, ?3, ?4)",
                params![id.to_string(), external_id, username, image_url],
            )
            .map_err(|e| on_conflict(e, "username"))?;
            id
        }
    };
    Ok(User {
        id,
        external_id: external_id.into(),
        username: username.into(),
        image_url: image_url.map(Into::into),
    })
}

/// Delete the user for a subject. Returns the removed user, if there was one.
pub fn remove(conn: &Connection, external_id: &str) -> Result<Option<User>> {
    let Some(user) = get_by_external_id(conn, external_id)? else {
        return Ok(None);
    };
    conn.execute("DELETE FROM users WHERE id = ?1", [user.id.to_string()])?;
    Ok(Some(user))
}
