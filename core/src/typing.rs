//! Ephemeral "is typing" markers.
//!
//! Each (user, conversation) pair is either absent or active until an
//! absolute `expires_at`. Every upsert schedules its own cleanup at the new
//! expiry and passes that expiry along; the cleanup only deletes an
//! indicator still carrying the same value, so a timer left over from an
//! earlier keystroke can never remove a renewed indicator.

use crate::db::{conversation_at, uuid_at, CONVERSATION_MATCH};
use crate::error::Result;
use crate::guard;
use crate::model::{ConversationRef, TypingIndicator, User};
use crate::scheduler::{self, Task};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

/// How long an indicator stays alive after the last keystroke.
pub const TYPING_WINDOW_MS: i64 = 5_000;

/// Load the indicator for a (user, conversation) pair.
pub fn find(
    conn: &Connection,
    user_id: &Uuid,
    conversation: ConversationRef,
) -> Result<Option<TypingIndicator>> {
    let (dm_id, channel_id) = conversation.columns();
    let indicator = conn
        .query_row(
            &format!(
                "SELECT user_id, dm_id, channel_id, expires_at FROM typing_indicators WHERE {CONVERSATION_MATCH} AND user_id = ?3"
            ),
            params![dm_id, channel_id, user_id.to_string()],
            |row| {
                Ok(TypingIndicator {
                    user_id: uuid_at(row, 0)?,
                    conversation: conversation_at(row, 1, 2)?,
                    expires_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(indicator)
}

/// Mark `caller` as typing in `conversation` until `now + TYPING_WINDOW_MS`
/// and schedule the matching cleanup. Returns the new expiry.
pub fn upsert(
    conn: &Connection,
    caller: &User,
    conversation: ConversationRef,
    now: i64,
) -> Result<i64> {
    guard::assert_conversation_member(conn, caller, conversation)?;
    let expires_at = now + TYPING_WINDOW_MS;
    let (dm_id, channel_id) = conversation.columns();
    let renewed = conn.execute(
        &format!(
            "UPDATE typing_indicators SET expires_at = ?4 WHERE {CONVERSATION_MATCH} AND user_id = ?3"
        ),
        params![dm_id, channel_id, caller.id.to_string(), expires_at],
    )?;
    if renewed == 0 {
        conn.execute(
            "INSERT INTO typing_indicators (user_id, dm_id, channel_id, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![caller.id.to_string(), dm_id, channel_id, expires_at],
        )?;
    }
    scheduler::run_at(
        conn,
        expires_at,
        &Task::RemoveTypingIndicator {
            user_id: caller.id,
            conversation,
            expires_at: Some(expires_at),
        },
    )?;
    Ok(expires_at)
}

/// Scheduled cleanup. With `expected` set, deletes only if the stored expiry
/// still matches it; a mismatch or a missing row is a normal no-op.
/// Returns whether a row was deleted.
pub fn expire(
    conn: &Connection,
    user_id: &Uuid,
    conversation: ConversationRef,
    expected: Option<i64>,
) -> Result<bool> {
    let Some(existing) = find(conn, user_id, conversation)? else {
        return Ok(false);
    };
    if let Some(expected) = expected {
        if existing.expires_at != expected {
            return Ok(false);
        }
    }
    remove(conn, user_id, conversation)
}

/// Unconditionally delete the indicator. Idempotent.
pub fn remove(conn: &Connection, user_id: &Uuid, conversation: ConversationRef) -> Result<bool> {
    let (dm_id, channel_id) = conversation.columns();
    let deleted = conn.execute(
        &format!("DELETE FROM typing_indicators WHERE {CONVERSATION_MATCH} AND user_id = ?3"),
        params![dm_id, channel_id, user_id.to_string()],
    )?;
    Ok(deleted > 0)
}

/// Usernames of everyone else currently typing in `conversation`.
pub fn list(
    conn: &Connection,
    caller: &User,
    conversation: ConversationRef,
    now: i64,
) -> Result<Vec<String>> {
    guard::assert_conversation_member(conn, caller, conversation)?;
    let (dm_id, channel_id) = conversation.columns();
    let mut stmt = conn.prepare(
        "SELECT u.username FROM typing_indicators t JOIN users u ON u.id = t.user_id \
         WHERE t.dm_id IS ?1 AND t.channel_id IS ?2 AND t.user_id <> ?3 AND t.expires_at > ?4 \
         ORDER BY u.username",
    )?;
    let names = stmt
        .query_map(
            params![dm_id, channel_id, caller.id.to_string(), now],
            |row| row.get(0),
        )?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

/// Drop indicators already past their expiry whose cleanup never ran.
pub fn purge_expired(conn: &Connection, now: i64) -> Result<usize> {
    let n = conn.execute("DELETE FROM typing_indicators WHERE expires_at <= ?1", [now])?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::tests::user;
    use crate::{db, dms, scheduler};

    fn setup() -> (Connection, User, User, ConversationRef) {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let bob = user(&conn, "bob");
        let dm = dms::create(&conn, &alice, "bob", 0).unwrap();
        (conn, alice, bob, ConversationRef::DirectMessage(dm))
    }

    #[test]
    fn upsert_is_visible_to_others_only() {
        let (conn, alice, bob, dm) = setup();
        upsert(&conn, &alice, dm, 1_000).unwrap();
        assert_eq!(list(&conn, &bob, dm, 1_000).unwrap(), vec!["alice"]);
        assert!(list(&conn, &alice, dm, 1_000).unwrap().is_empty());
    }

    #[test]
    fn upsert_keeps_a_single_row_and_schedules_each_time() {
        let (conn, alice, _bob, dm) = setup();
        assert_eq!(upsert(&conn, &alice, dm, 0).unwrap(), 5_000);
        assert_eq!(upsert(&conn, &alice, dm, 3_000).unwrap(), 8_000);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM typing_indicators", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(scheduler::pending_count(&conn).unwrap(), 2);
        assert_eq!(find(&conn, &alice.id, dm).unwrap().unwrap().expires_at, 8_000);
    }

    #[test]
    fn stale_cleanup_does_not_remove_renewed_indicator() {
        let (conn, alice, bob, dm) = setup();
        let first = upsert(&conn, &alice, dm, 0).unwrap();
        let second = upsert(&conn, &alice, dm, 3_000).unwrap();

        assert!(!expire(&conn, &alice.id, dm, Some(first)).unwrap());
        assert_eq!(list(&conn, &bob, dm, first).unwrap(), vec!["alice"]);

        assert!(expire(&conn, &alice.id, dm, Some(second)).unwrap());
        assert!(list(&conn, &bob, dm, second).unwrap().is_empty());
    }

    #[test]
    fn list_filters_expired_rows_without_cleanup() {
        let (conn, alice, bob, dm) = setup();
        let expires_at = upsert(&conn, &alice, dm, 0).unwrap();
        assert_eq!(list(&conn, &bob, dm, expires_at - 1).unwrap().len(), 1);
        assert!(list(&conn, &bob, dm, expires_at).unwrap().is_empty());
        assert_eq!(purge_expired(&conn, expires_at).unwrap(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (conn, alice, _bob, dm) = setup();
        assert!(!remove(&conn, &alice.id, dm).unwrap());
        upsert(&conn, &alice, dm, 0).unwrap();
        assert!(remove(&conn, &alice.id, dm).unwrap());
        assert!(!remove(&conn, &alice.id, dm).unwrap());
        assert!(!expire(&conn, &alice.id, dm, None).unwrap());
    }

    #[test]
    fn outsiders_cannot_type() {
        let (conn, _alice, _bob, dm) = setup();
        let carol = user(&conn, "carol");
        assert!(matches!(
            upsert(&conn, &carol, dm, 0),
            Err(crate::ChatError::NotAMember)
        ));
        assert_eq!(scheduler::pending_count(&conn).unwrap(), 0);
    }
}
