use crate::db::uuid_at;
use crate::error::{on_conflict, ChatError, Result};
use crate::model::{Friend, FriendStatus, FriendView, User};
use crate::users;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

fn row_to_friend(row: &Row<'_>) -> rusqlite::Result<Friend> {
    let status: String = row.get(3)?;
    Ok(Friend {
        id: uuid_at(row, 0)?,
        requester_id: uuid_at(row, 1)?,
        addressee_id: uuid_at(row, 2)?,
        status: FriendStatus::parse(&status).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(3, Type::Text, "unknown status".into())
        })?,
        created_at: row.get(4)?,
    })
}

/// Friend rows joined with the user on the other side. `other` names the
/// column holding that user's id.
fn with_users(
    conn: &Connection,
    other: &str,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<FriendView>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT f.id, f.requester_id, f.addressee_id, f.status, f.created_at, \
         u.id, u.external_id, u.username, u.image_url \
         FROM friends f JOIN users u ON u.id = f.{other} WHERE {filter} ORDER BY f.created_at, f.id"
    ))?;
    let views = stmt
        .query_map(args, |row| {
            Ok(FriendView {
                friend: row_to_friend(row)?,
                user: User {
                    id: uuid_at(row, 5)?,
                    external_id: row.get(6)?,
                    username: row.get(7)?,
                    image_url: row.get(8)?,
                },
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(views)
}

/// Send a friend request to `username`.
pub fn request(conn: &Connection, caller: &User, username: &str, now: i64) -> Result<Friend> {
    let other = users::get_by_username(conn, username)?.ok_or(ChatError::NotFound("user"))?;
    if other.id == caller.id {
        return Err(ChatError::InvalidInput("cannot add yourself as a friend"));
    }
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO friends (id, requester_id, addressee_id, status, created_at) VALUES (?1, ?2, ?3, 'pending', ?4)",
        params![id.to_string(), caller.id.to_string(), other.id.to_string(), now],
    )
    .map_err(|e| on_conflict(e, "friend request"))?;
    Ok(Friend {
        id,
        requester_id: caller.id,
        addressee_id: other.id,
        status: FriendStatus::Pending,
        created_at: now,
    })
}

/// Incoming requests still waiting for the caller's answer.
pub fn list_pending(conn: &Connection, caller: &User) -> Result<Vec<FriendView>> {
    let me = caller.id.to_string();
    with_users(
        conn,
        "requester_id",
        "f.addressee_id = ?1 AND f.status = 'pending'",
        &[&me],
    )
}

/// Accepted friendships in either direction.
pub fn list_accepted(conn: &Connection, caller: &User) -> Result<Vec<FriendView>> {
    let me = caller.id.to_string();
    let mut sent = with_users(
        conn,
        "addressee_id",
        "f.requester_id = ?1 AND f.status = 'accepted'",
        &[&me],
    )?;
    let received = with_users(
        conn,
        "requester_id",
        "f.addressee_id = ?1 AND f.status = 'accepted'",
        &[&me],
    )?;
    sent.extend(received);
    Ok(sent)
}

/// Accept or reject a request. Either party of the friendship may answer.
pub fn update_status(
    conn: &Connection,
    caller: &User,
    id: &Uuid,
    status: FriendStatus,
) -> Result<Friend> {
    if status == FriendStatus::Pending {
        return Err(ChatError::InvalidInput("status must be accepted or rejected"));
    }
    let mut friend = conn
        .query_row(
            "SELECT id, requester_id, addressee_id, status, created_at FROM friends WHERE id = ?1",
            [id.to_string()],
            row_to_friend,
        )
        .optional()?
        .ok_or(ChatError::NotFound("friend request"))?;
    if friend.requester_id != caller.id && friend.addressee_id != caller.id {
        return Err(ChatError::NotAMember);
    }
    conn.execute(
        "UPDATE friends SET status = ?2 WHERE id = ?1",
        params![id.to_string(), status.as_str()],
    )?;
    friend.status = status;
    Ok(friend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::users::tests::user;

    #[test]
    fn request_then_accept() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let req = request(&conn, &alice, "bob", 0).unwrap();

        let pending = list_pending(&conn, &bob).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].user, alice);
        assert!(list_pending(&conn, &alice).unwrap().is_empty());

        update_status(&conn, &bob, &req.id, FriendStatus::Accepted).unwrap();
        assert!(list_pending(&conn, &bob).unwrap().is_empty());
        assert_eq!(list_accepted(&conn, &alice).unwrap()[0].user, bob);
        assert_eq!(list_accepted(&conn, &bob).unwrap()[0].user, alice);
    }

    #[test]
    fn duplicate_and_self_requests_fail() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        request(&conn, &alice, "bob", 0).unwrap();
        assert!(matches!(
            request(&conn, &bob, "alice", 1),
            Err(ChatError::AlreadyExists(_))
        ));
        assert!(matches!(
            request(&conn, &alice, "alice", 1),
            Err(ChatError::InvalidInput(_))
        ));
        assert!(matches!(
            request(&conn, &alice, "zed", 1),
            Err(ChatError::NotFound("user"))
        ));
    }

    #[test]
    fn strangers_cannot_answer() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        user(&conn, "bob");
        let carol = user(&conn, "carol");
        let req = request(&conn, &alice, "bob", 0).unwrap();
        assert!(matches!(
            update_status(&conn, &carol, &req.id, FriendStatus::Rejected),
            Err(ChatError::NotAMember)
        ));
        assert!(matches!(
            update_status(&conn, &alice, &Uuid::new_v4(), FriendStatus::Accepted),
            Err(ChatError::NotFound(_))
        ));
    }
}
