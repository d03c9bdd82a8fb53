use crate::db::{conversation_at, opt_uuid_at, uuid_at};
use crate::error::{ChatError, Result};
use crate::guard;
use crate::model::{BlobRef, ConversationRef, Message, MessageView, User};
use crate::scheduler::{self, Task};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

/// Upper bound for a single page of messages.
pub const MAX_PAGE: usize = 200;

const MESSAGE_COLUMNS: &str =
    "m.id, m.dm_id, m.channel_id, m.sender_id, m.content, m.attachment_id, m.created_at";

fn row_to_msg(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation: conversation_at(row, 1, 2)?,
        sender_id: uuid_at(row, 3)?,
        content: row.get(4)?,
        attachment: opt_uuid_at(row, 5)?.map(BlobRef),
        created_at: row.get(6)?,
    })
}

pub fn find(conn: &Connection, id: &Uuid) -> Result<Option<Message>> {
    let msg = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
            [id.to_string()],
            row_to_msg,
        )
        .optional()?;
    Ok(msg)
}

/// Send a message. Clears the sender's typing indicator once committed by
/// scheduling an immediate, unconditional cleanup.
pub fn create(
    conn: &Connection,
    caller: &User,
    conversation: ConversationRef,
    content: &str,
    attachment: Option<BlobRef>,
    now: i64,
) -> Result<Message> {
    guard::assert_conversation_member(conn, caller, conversation)?;
    if content.trim().is_empty() && attachment.is_none() {
        return Err(ChatError::InvalidInput("message is empty"));
    }
    let id = Uuid::new_v4();
    let (dm_id, channel_id) = conversation.columns();
    conn.execute(
        "INSERT INTO messages (id, dm_id, channel_id, sender_id, content, attachment_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id.to_string(),
            dm_id,
            channel_id,
            caller.id.to_string(),
            content,
            attachment.map(|a| a.to_string()),
            now
        ],
    )?;
    scheduler::run_after(
        conn,
        now,
        0,
        &Task::RemoveTypingIndicator {
            user_id: caller.id,
            conversation,
            expires_at: None,
        },
    )?;
    Ok(Message {
        id,
        conversation,
        sender_id: caller.id,
        content: content.into(),
        attachment,
        created_at: now,
    })
}

/// Messages of a conversation in chronological order. With `before`, the
/// page ends just ahead of that message.
pub fn list<F>(
    conn: &Connection,
    caller: &User,
    conversation: ConversationRef,
    before: Option<&Uuid>,
    limit: usize,
    attachment_url: F,
) -> Result<Vec<MessageView>>
where
    F: Fn(&BlobRef) -> Option<String>,
{
    guard::assert_conversation_member(conn, caller, conversation)?;
    let limit = limit.clamp(1, MAX_PAGE);
    let (dm_id, channel_id) = conversation.columns();
    // the cursor must belong to the listed conversation
    let (ts, cursor_id) = match before {
        Some(id) => {
            let ts: Option<i64> = conn
                .query_row(
                    "SELECT created_at FROM messages WHERE id = ?1 AND dm_id IS ?2 AND channel_id IS ?3",
                    params![id.to_string(), dm_id, channel_id],
                    |row| row.get(0),
                )
                .optional()?;
            (ts.ok_or(ChatError::NotFound("message"))?, id.to_string())
        }
        None => (i64::MAX, String::new()),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS}, u.id, u.external_id, u.username, u.image_url \
         FROM messages m JOIN users u ON u.id = m.sender_id \
         WHERE m.dm_id IS ?1 AND m.channel_id IS ?2 \
         AND (m.created_at < ?3 OR (m.created_at = ?3 AND ?4 <> '' AND m.id < ?4)) \
         ORDER BY m.created_at DESC, m.id DESC LIMIT ?5"
    ))?;
    let rows = stmt.query_map(
        params![dm_id, channel_id, ts, cursor_id, limit as i64],
        |row| {
            let message = row_to_msg(row)?;
            let sender = User {
                id: uuid_at(row, 7)?,
                external_id: row.get(8)?,
                username: row.get(9)?,
                image_url: row.get(10)?,
            };
            Ok((message, sender))
        },
    )?;
    let mut out = Vec::new();
    for row in rows {
        let (message, sender) = row?;
        let attachment_url = message.attachment.as_ref().and_then(&attachment_url);
        out.push(MessageView {
            message,
            sender,
            attachment_url,
        });
    }
    out.reverse();
    Ok(out)
}

/// Delete one of the caller's own messages. The returned message still
/// names the attachment, which the caller must release afterwards.
pub fn remove(conn: &Connection, caller: &User, id: &Uuid) -> Result<Message> {
    let msg = find(conn, id)?.ok_or(ChatError::NotFound("message"))?;
    guard::assert_conversation_member(conn, caller, msg.conversation)?;
    if msg.sender_id != caller.id {
        return Err(ChatError::NotOwner);
    }
    conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
    Ok(msg)
}

/// Blob references attached to messages.
pub fn attachment_refs(conn: &Connection) -> Result<Vec<BlobRef>> {
    let mut stmt = conn.prepare("SELECT attachment_id FROM messages WHERE attachment_id IS NOT NULL")?;
    let refs = stmt
        .query_map([], |row| uuid_at(row, 0).map(BlobRef))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CONVERSATION_MATCH;
    use crate::users::tests::user;
    use crate::{db, servers, typing};

    fn count(conn: &Connection, conversation: ConversationRef) -> i64 {
        let (dm_id, channel_id) = conversation.columns();
        conn.query_row(
            &format!("SELECT COUNT(*) FROM messages WHERE {CONVERSATION_MATCH}"),
            params![dm_id, channel_id],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn setup() -> (Connection, User, ConversationRef) {
        let conn = db::init_db(":memory:").unwrap();
        let alice = user(&conn, "alice");
        let home = servers::create(&conn, &alice, "Home", None, 0).unwrap();
        (conn, alice, ConversationRef::Channel(home.default_channel_id))
    }

    fn no_urls(_: &BlobRef) -> Option<String> {
        None
    }

    #[test]
    fn create_and_validate() {
        let (conn, alice, general) = setup();
        assert!(matches!(
            create(&conn, &alice, general, "   ", None, 0),
            Err(ChatError::InvalidInput(_))
        ));
        let blob = BlobRef(Uuid::new_v4());
        let only_image = create(&conn, &alice, general, "", Some(blob), 0).unwrap();
        assert_eq!(only_image.attachment, Some(blob));
        let m = create(&conn, &alice, general, "hi", None, 1).unwrap();
        assert_eq!(find(&conn, &m.id).unwrap().unwrap(), m);
        assert_eq!(count(&conn, general), 2);
    }

    #[test]
    fn sending_schedules_typing_cleanup() {
        let (conn, alice, general) = setup();
        typing::upsert(&conn, &alice, general, 0).unwrap();
        create(&conn, &alice, general, "done typing", None, 100).unwrap();
        let job = scheduler::next_due(&conn, 100).unwrap().unwrap();
        assert_eq!(
            job.task.unwrap(),
            Task::RemoveTypingIndicator {
                user_id: alice.id,
                conversation: general,
                expires_at: None,
            }
        );
    }

    #[test]
    fn pagination_order() {
        let (conn, alice, general) = setup();
        for (i, text) in ["m1", "m2", "m3"].iter().enumerate() {
            create(&conn, &alice, general, text, None, i as i64).unwrap();
        }
        let all = list(&conn, &alice, general, None, 50, no_urls).unwrap();
        let texts: Vec<_> = all.iter().map(|m| m.message.content.as_str()).collect();
        assert_eq!(texts, vec!["m1", "m2", "m3"]);
        assert_eq!(all[0].sender, alice);

        let last_two = list(&conn, &alice, general, None, 2, no_urls).unwrap();
        assert_eq!(last_two.len(), 2);
        let earlier = list(
            &conn,
            &alice,
            general,
            Some(&last_two[0].message.id),
            2,
            no_urls,
        )
        .unwrap();
        let mut combined = earlier.clone();
        combined.extend(last_two);
        assert_eq!(combined, all);
    }

    #[test]
    fn cursor_from_another_conversation_is_not_found() {
        let (conn, alice, general) = setup();
        let work = servers::create(&conn, &alice, "Work", None, 0).unwrap();
        let elsewhere = ConversationRef::Channel(work.default_channel_id);
        let foreign = create(&conn, &alice, elsewhere, "other place", None, 5).unwrap();
        create(&conn, &alice, general, "here", None, 1).unwrap();
        assert!(matches!(
            list(&conn, &alice, general, Some(&foreign.id), 10, no_urls),
            Err(ChatError::NotFound("message"))
        ));
        let page = list(&conn, &alice, elsewhere, Some(&foreign.id), 10, no_urls).unwrap();
        assert!(page.is_empty());
    }

    #[test]
    fn attachment_urls_are_resolved() {
        let (conn, alice, general) = setup();
        let blob = BlobRef(Uuid::new_v4());
        create(&conn, &alice, general, "pic", Some(blob), 0).unwrap();
        let listed = list(&conn, &alice, general, None, 10, |r| {
            Some(format!("http://blobs/{r}"))
        })
        .unwrap();
        assert_eq!(
            listed[0].attachment_url.as_deref(),
            Some(format!("http://blobs/{blob}").as_str())
        );
        assert_eq!(attachment_refs(&conn).unwrap(), vec![blob]);
    }

    #[test]
    fn only_sender_removes() {
        let (conn, alice, general) = setup();
        let bob = user(&conn, "bob");
        let m = create(&conn, &alice, general, "mine", None, 0).unwrap();
        assert!(matches!(remove(&conn, &bob, &m.id), Err(ChatError::NotAMember)));
        let removed = remove(&conn, &alice, &m.id).unwrap();
        assert_eq!(removed.id, m.id);
        assert!(matches!(
            remove(&conn, &alice, &m.id),
            Err(ChatError::NotFound("message"))
        ));
    }
}
