use crate::db::uuid_at;
use crate::error::{ChatError, Result};
use crate::guard;
use crate::model::{Invite, InviteView, Server, User};
use crate::servers;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

const INVITE_COLUMNS: &str = "id, server_id, created_by, expires_at, max_uses, uses, created_at";

fn row_to_invite(row: &Row<'_>) -> rusqlite::Result<Invite> {
    Ok(Invite {
        id: uuid_at(row, 0)?,
        server_id: uuid_at(row, 1)?,
        created_by: uuid_at(row, 2)?,
        expires_at: row.get(3)?,
        max_uses: row.get(4)?,
        uses: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl Invite {
    /// Whether the invite can still admit a new member at `now`.
    pub fn is_usable(&self, now: i64) -> bool {
        let fresh = self.expires_at.map_or(true, |at| at > now);
        let has_uses = self.max_uses.map_or(true, |max| self.uses < max);
        fresh && has_uses
    }
}

pub fn find(conn: &Connection, id: &Uuid) -> Result<Option<Invite>> {
    let invite = conn
        .query_row(
            &format!("SELECT {INVITE_COLUMNS} FROM invites WHERE id = ?1"),
            [id.to_string()],
            row_to_invite,
        )
        .optional()?;
    Ok(invite)
}

/// Create an invite for a server the caller owns. `max_uses` of zero means
/// unlimited.
pub fn create(
    conn: &Connection,
    caller: &User,
    server_id: &Uuid,
    max_uses: Option<u32>,
    expires_at: Option<i64>,
    now: i64,
) -> Result<Invite> {
    guard::assert_server_owner(conn, caller, server_id)?;
    if matches!(expires_at, Some(at) if at <= now) {
        return Err(ChatError::InvalidInput("invite expiry is in the past"));
    }
    let max_uses = max_uses.filter(|n| *n > 0);
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO invites (id, server_id, created_by, expires_at, max_uses, uses, created_at) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
        params![
            id.to_string(),
            server_id.to_string(),
            caller.id.to_string(),
            expires_at,
            max_uses,
            now
        ],
    )?;
    Ok(Invite {
        id,
        server_id: *server_id,
        created_by: caller.id,
        expires_at,
        max_uses,
        uses: 0,
        created_at: now,
    })
}

/// Invite details shown on the join page. Any signed-in user may look.
pub fn get(conn: &Connection, id: &Uuid) -> Result<InviteView> {
    let invite = find(conn, id)?.ok_or(ChatError::NotFound("invite"))?;
    let server = servers::find(conn, &invite.server_id)?.ok_or(ChatError::NotFound("server"))?;
    Ok(InviteView { invite, server })
}

/// Consume an invite. Joining a server one already belongs to succeeds
/// without using up the invite.
pub fn join(conn: &Connection, caller: &User, id: &Uuid, now: i64) -> Result<Server> {
    let invite = find(conn, id)?.ok_or(ChatError::NotFound("invite"))?;
    let server = servers::find(conn, &invite.server_id)?.ok_or(ChatError::NotFound("server"))?;
    if guard::is_server_member(conn, &caller.id, &server.id)? {
        return Ok(server);
    }
    if !invite.is_usable(now) {
        return Err(ChatError::InviteExpired);
    }
    conn.execute(
        "INSERT INTO server_members (server_id, user_id) VALUES (?1, ?2)",
        params![server.id.to_string(), caller.id.to_string()],
    )?;
    conn.execute(
        "UPDATE invites SET uses = uses + 1 WHERE id = ?1",
        [id.to_string()],
    )?;
    Ok(server)
}

/// Invites of a server, newest first. Owner only.
pub fn list(conn: &Connection, caller: &User, server_id: &Uuid) -> Result<Vec<Invite>> {
    guard::assert_server_owner(conn, caller, server_id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {INVITE_COLUMNS} FROM invites WHERE server_id = ?1 ORDER BY created_at DESC, id"
    ))?;
    let invites = stmt
        .query_map([server_id.to_string()], row_to_invite)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(invites)
}

/// Delete an invite. Owner only.
pub fn revoke(conn: &Connection, caller: &User, id: &Uuid) -> Result<Invite> {
    let invite = find(conn, id)?.ok_or(ChatError::NotFound("invite"))?;
    guard::assert_server_owner(conn, caller, &invite.server_id)?;
    conn.execute("DELETE FROM invites WHERE id = ?1", [id.to_string()])?;
    Ok(invite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::user;
    use crate::{db, servers};

    #[test]
    fn join_grants_membership_once() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let home = servers::create(&conn, &alice, "Home", None, 0).unwrap();
        let invite = create(&conn, &alice, &home.server_id, Some(5), None, 0).unwrap();

        let server = join(&conn, &bob, &invite.id, 10).unwrap();
        assert_eq!(server.id, home.server_id);
        join(&conn, &bob, &invite.id, 11).unwrap();
        assert_eq!(find(&conn, &invite.id).unwrap().unwrap().uses, 1);
        assert!(guard::is_server_member(&conn, &bob.id, &home.server_id).unwrap());
    }

    #[test]
    fn exhausted_and_expired_invites_are_refused() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let carol = user(&conn, "carol");
        let home = servers::create(&conn, &alice, "Home", None, 0).unwrap();

        let single = create(&conn, &alice, &home.server_id, Some(1), None, 0).unwrap();
        join(&conn, &bob, &single.id, 0).unwrap();
        assert!(matches!(
            join(&conn, &carol, &single.id, 0),
            Err(ChatError::InviteExpired)
        ));

        let timed = create(&conn, &alice, &home.server_id, None, Some(1_000), 0).unwrap();
        assert!(matches!(
            join(&conn, &carol, &timed.id, 1_000),
            Err(ChatError::InviteExpired)
        ));
        join(&conn, &carol, &timed.id, 999).unwrap();
    }

    #[test]
    fn zero_max_uses_means_unlimited() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let home = servers::create(&conn, &alice, "Home", None, 0).unwrap();
        let invite = create(&conn, &alice, &home.server_id, Some(0), None, 0).unwrap();
        assert_eq!(invite.max_uses, None);
        assert!(matches!(
            create(&conn, &alice, &home.server_id, None, Some(0), 5),
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[test]
    fn only_owner_manages_invites() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let home = servers::create(&conn, &alice, "Home", None, 0).unwrap();
        assert!(matches!(
            create(&conn, &bob, &home.server_id, None, None, 0),
            Err(ChatError::NotOwner)
        ));
        let invite = create(&conn, &alice, &home.server_id, None, None, 0).unwrap();
        assert_eq!(get(&conn, &invite.id).unwrap().server.name, "Home");
        assert!(matches!(list(&conn, &bob, &home.server_id), Err(ChatError::NotOwner)));
        assert!(matches!(revoke(&conn, &bob, &invite.id), Err(ChatError::NotOwner)));
        revoke(&conn, &alice, &invite.id).unwrap();
        assert!(list(&conn, &alice, &home.server_id).unwrap().is_empty());
        assert!(matches!(
            join(&conn, &bob, &invite.id, 0),
            Err(ChatError::NotFound("invite"))
        ));
    }
}
