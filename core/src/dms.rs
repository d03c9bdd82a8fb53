use crate::db::uuid_at;
use crate::error::{ChatError, Result};
use crate::guard;
use crate::model::{DirectMessageView, User};
use crate::users::{self, row_to_user};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// The DM both users already share, if any.
pub fn find_between(conn: &Connection, a: &Uuid, b: &Uuid) -> Result<Option<Uuid>> {
    let id = conn
        .query_row(
            "SELECT m1.dm_id FROM dm_members m1 JOIN dm_members m2 ON m1.dm_id = m2.dm_id \
             WHERE m1.user_id = ?1 AND m2.user_id = ?2 LIMIT 1",
            params![a.to_string(), b.to_string()],
            |row| uuid_at(row, 0),
        )
        .optional()?;
    Ok(id)
}

/// Open a DM with `username`, reusing the existing thread for the pair.
pub fn create(conn: &Connection, caller: &User, username: &str, now: i64) -> Result<Uuid> {
    let other = users::get_by_username(conn, username)?.ok_or(ChatError::NotFound("user"))?;
    if other.id == caller.id {
        return Err(ChatError::InvalidInput("cannot message yourself"));
    }
    if let Some(existing) = find_between(conn, &caller.id, &other.id)? {
        return Ok(existing);
    }
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO direct_messages (id, created_at) VALUES (?1, ?2)",
        params![id.to_string(), now],
    )?;
    for member in [&caller.id, &other.id] {
        conn.execute(
            "INSERT INTO dm_members (dm_id, user_id) VALUES (?1, ?2)",
            params![id.to_string(), member.to_string()],
        )?;
    }
    Ok(id)
}

fn view(conn: &Connection, caller: &User, id: &Uuid) -> Result<Option<DirectMessageView>> {
    let row = conn
        .query_row(
            "SELECT d.created_at, u.id, u.external_id, u.username, u.image_url \
             FROM direct_messages d JOIN dm_members m ON m.dm_id = d.id JOIN users u ON u.id = m.user_id \
             WHERE d.id = ?1 AND m.user_id <> ?2 LIMIT 1",
            params![id.to_string(), caller.id.to_string()],
            |row| {
                let created_at: i64 = row.get(0)?;
                // user columns start at index 1
                let other_user = User {
                    id: uuid_at(row, 1)?,
                    external_id: row.get(2)?,
                    username: row.get(3)?,
                    image_url: row.get(4)?,
                };
                Ok((created_at, other_user))
            },
        )
        .optional()?;
    Ok(row.map(|(created_at, other_user)| DirectMessageView {
        id: *id,
        created_at,
        other_user,
    }))
}

/// A DM the caller belongs to, with the other participant.
pub fn get(conn: &Connection, caller: &User, id: &Uuid) -> Result<DirectMessageView> {
    guard::assert_dm_member(conn, caller, id)?;
    view(conn, caller, id)?.ok_or(ChatError::NotFound("direct message participant"))
}

/// Every DM of the caller. Threads whose other participant deleted their
/// account are skipped.
pub fn list(conn: &Connection, caller: &User) -> Result<Vec<DirectMessageView>> {
    let mut stmt = conn.prepare(
        "SELECT m.dm_id FROM dm_members m JOIN direct_messages d ON d.id = m.dm_id \
         WHERE m.user_id = ?1 ORDER BY d.created_at, d.id",
    )?;
    let ids = stmt
        .query_map([caller.id.to_string()], |row| uuid_at(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(dm) = view(conn, caller, &id)? {
            out.push(dm);
        }
    }
    Ok(out)
}

/// Participants of a DM.
pub fn members(conn: &Connection, id: &Uuid) -> Result<Vec<User>> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.external_id, u.username, u.image_url FROM users u \
         JOIN dm_members m ON m.user_id = u.id WHERE m.dm_id = ?1 ORDER BY u.username",
    )?;
    let users = stmt
        .query_map([id.to_string()], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::users::tests::user;

    #[test]
    fn create_reuses_existing_pair() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let first = create(&conn, &alice, "bob", 0).unwrap();
        let again = create(&conn, &bob, "alice", 1).unwrap();
        assert_eq!(first, again);
        assert_eq!(members(&conn, &first).unwrap().len(), 2);
        let threads: i64 = conn
            .query_row("SELECT COUNT(*) FROM direct_messages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(threads, 1);
    }

    #[test]
    fn create_validates_target() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        assert!(matches!(
            create(&conn, &alice, "nobody", 0),
            Err(ChatError::NotFound("user"))
        ));
        assert!(matches!(
            create(&conn, &alice, "alice", 0),
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[test]
    fn views_show_the_other_participant() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let carol = user(&conn, "carol");
        let ab = create(&conn, &alice, "bob", 0).unwrap();
        create(&conn, &alice, "carol", 1).unwrap();

        let listed: Vec<_> = list(&conn, &alice)
            .unwrap()
            .into_iter()
            .map(|dm| dm.other_user.username)
            .collect();
        assert_eq!(listed, vec!["bob", "carol"]);
        assert_eq!(get(&conn, &bob, &ab).unwrap().other_user, alice);
        assert!(matches!(get(&conn, &carol, &ab), Err(ChatError::NotAMember)));
    }

    #[test]
    fn deleted_partner_hides_thread() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        user(&conn, "bob");
        create(&conn, &alice, "bob", 0).unwrap();
        users::remove(&conn, "bob").unwrap();
        assert!(list(&conn, &alice).unwrap().is_empty());
    }
}
