use crate::db::{opt_uuid_at, uuid_at};
use crate::error::{ChatError, Result};
use crate::guard;
use crate::model::{BlobRef, CreatedServer, Server, User};
use crate::users::{row_to_user, USER_COLUMNS};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// Name of the channel every server starts with.
pub const DEFAULT_CHANNEL: &str = "general";

const SERVER_COLUMNS: &str = "id, name, owner_id, icon_id, default_channel_id, created_at";

fn row_to_server(row: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        owner_id: uuid_at(row, 2)?,
        icon_id: opt_uuid_at(row, 3)?.map(BlobRef),
        default_channel_id: uuid_at(row, 4)?,
        created_at: row.get(5)?,
    })
}

pub fn find(conn: &Connection, id: &Uuid) -> Result<Option<Server>> {
    let server = conn
        .query_row(
            &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
            [id.to_string()],
            row_to_server,
        )
        .optional()?;
    Ok(server)
}

/// Create a server together with its default channel and the owner's membership.
pub fn create(
    conn: &Connection,
    caller: &User,
    name: &str,
    icon: Option<BlobRef>,
    now: i64,
) -> Result<CreatedServer> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ChatError::InvalidInput("server name is empty"));
    }
    let server_id = Uuid::new_v4();
    let default_channel_id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO servers (id, name, owner_id, icon_id, default_channel_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            server_id.to_string(),
            name,
            caller.id.to_string(),
            icon.map(|i| i.to_string()),
            default_channel_id.to_string(),
            now
        ],
    )?;
    conn.execute(
        "INSERT INTO channels (id, server_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            default_channel_id.to_string(),
            server_id.to_string(),
            DEFAULT_CHANNEL,
            now
        ],
    )?;
    conn.execute(
        "INSERT INTO server_members (server_id, user_id) VALUES (?1, ?2)",
        params![server_id.to_string(), caller.id.to_string()],
    )?;
    Ok(CreatedServer {
        server_id,
        default_channel_id,
    })
}

/// Servers the caller belongs to, oldest first.
pub fn list(conn: &Connection, caller: &User) -> Result<Vec<Server>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.name, s.owner_id, s.icon_id, s.default_channel_id, s.created_at \
         FROM servers s JOIN server_members m ON m.server_id = s.id \
         WHERE m.user_id = ?1 ORDER BY s.created_at, s.id",
    )?;
    let servers = stmt
        .query_map([caller.id.to_string()], row_to_server)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(servers)
}

pub fn get(conn: &Connection, caller: &User, id: &Uuid) -> Result<Server> {
    guard::assert_server_member(conn, caller, id)
}

/// Users who belong to the server, by username.
pub fn members(conn: &Connection, caller: &User, id: &Uuid) -> Result<Vec<User>> {
    guard::assert_server_member(conn, caller, id)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id IN \
         (SELECT user_id FROM server_members WHERE server_id = ?1) ORDER BY username"
    ))?;
    let users = stmt
        .query_map([id.to_string()], row_to_user)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(users)
}

/// Blob references used as server icons.
pub fn icon_refs(conn: &Connection) -> Result<Vec<BlobRef>> {
    let mut stmt = conn.prepare("SELECT icon_id FROM servers WHERE icon_id IS NOT NULL")?;
    let refs = stmt
        .query_map([], |row| uuid_at(row, 0).map(BlobRef))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::user;
    use crate::{channels, db, invites};

    #[test]
    fn create_sets_up_default_channel_and_owner() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let created = create(&conn, &alice, "  Home  ", None, 10).unwrap();
        let server = get(&conn, &alice, &created.server_id).unwrap();
        assert_eq!(server.name, "Home");
        assert_eq!(server.owner_id, alice.id);
        assert_eq!(server.default_channel_id, created.default_channel_id);

        let chans = channels::list(&conn, &alice, &created.server_id).unwrap();
        assert_eq!(chans.len(), 1);
        assert_eq!(chans[0].name, DEFAULT_CHANNEL);
        assert_eq!(members(&conn, &alice, &created.server_id).unwrap(), vec![alice]);
    }

    #[test]
    fn list_only_shows_joined_servers() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let home = create(&conn, &alice, "Home", None, 0).unwrap();
        create(&conn, &alice, "Work", None, 1).unwrap();
        assert_eq!(list(&conn, &alice).unwrap().len(), 2);
        assert!(list(&conn, &bob).unwrap().is_empty());

        let invite = invites::create(&conn, &alice, &home.server_id, None, None, 0).unwrap();
        invites::join(&conn, &bob, &invite.id, 0).unwrap();
        let names: Vec<_> = list(&conn, &bob).unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Home"]);
        assert_eq!(members(&conn, &bob, &home.server_id).unwrap().len(), 2);
    }

    #[test]
    fn blank_name_is_rejected() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        assert!(matches!(
            create(&conn, &alice, "   ", None, 0),
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[test]
    fn non_members_cannot_read() {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let home = create(&conn, &alice, "Home", None, 0).unwrap();
        assert!(matches!(
            get(&conn, &bob, &home.server_id),
            Err(ChatError::NotAMember)
        ));
        assert!(matches!(
            members(&conn, &bob, &home.server_id),
            Err(ChatError::NotAMember)
        ));
    }
}
