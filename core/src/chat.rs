//! The entry point adapters talk to.
//!
//! Every operation takes the caller's [`Identity`] explicitly, runs its guard
//! and mutation inside one `IMMEDIATE` transaction, and publishes a
//! [`Change`] once that transaction has committed.

use crate::blobs::BlobStore;
use crate::clock::Clock;
use crate::db::DbPool;
use crate::error::{ChatError, Result};
use crate::model::{
    BlobRef, Channel, ConversationRef, CreatedServer, DirectMessageView, Friend, FriendStatus,
    FriendView, Identity, Invite, InviteView, Message, MessageView, Server, ServerView, User,
};
use crate::scheduler::{self, Task};
use crate::{channels, dms, friends, guard, invites, messages, servers, typing, users};
use rusqlite::{Connection, TransactionBehavior};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Longest the dispatcher sleeps between passes.
const DISPATCH_IDLE_MS: i64 = 1_000;

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeScope {
    Conversation,
    Server,
    User,
    Friends,
}

/// Notification that data under `scope`/`id` changed and dependent queries
/// should be re-evaluated.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Change {
    pub scope: ChangeScope,
    pub id: Uuid,
}

impl Change {
    fn conversation(conversation: ConversationRef) -> Self {
        Self {
            scope: ChangeScope::Conversation,
            id: conversation.id(),
        }
    }

    fn server(id: Uuid) -> Self {
        Self {
            scope: ChangeScope::Server,
            id,
        }
    }

    fn user(id: Uuid) -> Self {
        Self {
            scope: ChangeScope::User,
            id,
        }
    }

    fn friends(user_id: Uuid) -> Self {
        Self {
            scope: ChangeScope::Friends,
            id: user_id,
        }
    }
}

pub struct Chat {
    pool: DbPool,
    clock: Arc<dyn Clock>,
    blobs: Arc<dyn BlobStore>,
    wake: Notify,
    changes: broadcast::Sender<Change>,
}

impl Chat {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>, blobs: Arc<dyn BlobStore>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            pool,
            clock,
            blobs,
            wake: Notify::new(),
            changes,
        }
    }

    pub fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.changes.subscribe()
    }

    /// Whether the caller may learn about `change`. Conversations and
    /// servers need a membership, user and friend changes are only ever
    /// shown to the user they are about.
    pub fn may_observe(&self, identity: &Identity, change: &Change) -> Result<bool> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            match change.scope {
                ChangeScope::User | ChangeScope::Friends => Ok(change.id == caller.id),
                ChangeScope::Server => guard::is_server_member(conn, &caller.id, &change.id),
                ChangeScope::Conversation => {
                    if guard::is_dm_member(conn, &caller.id, &change.id)? {
                        return Ok(true);
                    }
                    match channels::find(conn, &change.id)? {
                        Some(channel) => {
                            guard::is_server_member(conn, &caller.id, &channel.server_id)
                        }
                        None => Ok(false),
                    }
                }
            }
        })
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.pool.get()?;
        f(&conn)
    }

    fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    fn publish(&self, change: Change) {
        // no subscribers is fine
        let _ = self.changes.send(change);
    }

    fn url_string(&self, blob: &BlobRef) -> Option<String> {
        self.blobs.get_url(blob).map(|u| u.to_string())
    }

    fn server_view(&self, server: Server) -> ServerView {
        let icon_url = server.icon_id.as_ref().and_then(|i| self.url_string(i));
        ServerView { server, icon_url }
    }

    /// The blob must exist and belong to `caller`.
    fn check_upload(&self, caller: &User, blob: &BlobRef, what: &'static str) -> Result<()> {
        match self.blobs.owner(blob) {
            None => Err(ChatError::NotFound(what)),
            Some(owner) if owner != caller.id => Err(ChatError::NotOwner),
            Some(_) => Ok(()),
        }
    }

    fn release(&self, blob: &BlobRef) {
        if let Err(e) = self.blobs.delete(blob) {
            warn!(blob = %blob, "failed to delete blob, leaving it for housekeeping: {e}");
        }
    }

    // users

    pub fn me(&self, identity: &Identity) -> Result<User> {
        self.read(|conn| users::current(conn, identity))
    }

    pub fn upsert_user(
        &self,
        external_id: &str,
        username: &str,
        image_url: Option<&str>,
    ) -> Result<User> {
        let user = self.write(|conn| users::upsert(conn, external_id, username, image_url))?;
        info!(user = %user.id, username = %user.username, "user synced");
        self.publish(Change::user(user.id));
        Ok(user)
    }

    pub fn remove_user(&self, external_id: &str) -> Result<Option<User>> {
        let removed = self.write(|conn| users::remove(conn, external_id))?;
        if let Some(user) = &removed {
            info!(user = %user.id, "user deleted");
            self.publish(Change::user(user.id));
        }
        Ok(removed)
    }

    // servers and channels

    pub fn create_server(
        &self,
        identity: &Identity,
        name: &str,
        icon: Option<BlobRef>,
    ) -> Result<CreatedServer> {
        let now = self.now();
        let created = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            if let Some(icon) = &icon {
                self.check_upload(&caller, icon, "icon")?;
            }
            servers::create(conn, &caller, name, icon, now)
        })?;
        self.publish(Change::server(created.server_id));
        Ok(created)
    }

    pub fn list_servers(&self, identity: &Identity) -> Result<Vec<ServerView>> {
        let servers = self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            servers::list(conn, &caller)
        })?;
        Ok(servers.into_iter().map(|s| self.server_view(s)).collect())
    }

    pub fn get_server(&self, identity: &Identity, id: &Uuid) -> Result<ServerView> {
        let server = self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            servers::get(conn, &caller, id)
        })?;
        Ok(self.server_view(server))
    }

    pub fn server_members(&self, identity: &Identity, id: &Uuid) -> Result<Vec<User>> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            servers::members(conn, &caller, id)
        })
    }

    pub fn list_channels(&self, identity: &Identity, server_id: &Uuid) -> Result<Vec<Channel>> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            channels::list(conn, &caller, server_id)
        })
    }

    pub fn get_channel(&self, identity: &Identity, id: &Uuid) -> Result<Channel> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            channels::get(conn, &caller, id)
        })
    }

    pub fn create_channel(
        &self,
        identity: &Identity,
        server_id: &Uuid,
        name: &str,
    ) -> Result<Channel> {
        let now = self.now();
        let channel = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            channels::create(conn, &caller, server_id, name, now)
        })?;
        self.publish(Change::server(channel.server_id));
        Ok(channel)
    }

    /// Delete a channel, then release the attachments of its messages.
    pub fn remove_channel(&self, identity: &Identity, id: &Uuid) -> Result<Channel> {
        let (removed, unused) = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            let removed = channels::remove(conn, &caller, id)?;
            let unused = unreferenced(conn, removed.attachments.iter().copied())?;
            Ok((removed, unused))
        })?;
        for blob in &unused {
            self.release(blob);
        }
        self.publish(Change::server(removed.channel.server_id));
        self.publish(Change::conversation(ConversationRef::Channel(removed.channel.id)));
        Ok(removed.channel)
    }

    // invites

    pub fn create_invite(
        &self,
        identity: &Identity,
        server_id: &Uuid,
        max_uses: Option<u32>,
        expires_at: Option<i64>,
    ) -> Result<Invite> {
        let now = self.now();
        let invite = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            invites::create(conn, &caller, server_id, max_uses, expires_at, now)
        })?;
        self.publish(Change::server(invite.server_id));
        Ok(invite)
    }

    pub fn get_invite(&self, identity: &Identity, id: &Uuid) -> Result<InviteView> {
        self.read(|conn| {
            guard::resolve_caller(conn, identity)?;
            invites::get(conn, id)
        })
    }

    pub fn join_invite(&self, identity: &Identity, id: &Uuid) -> Result<ServerView> {
        let now = self.now();
        let server = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            invites::join(conn, &caller, id, now)
        })?;
        self.publish(Change::server(server.id));
        Ok(self.server_view(server))
    }

    pub fn list_invites(&self, identity: &Identity, server_id: &Uuid) -> Result<Vec<Invite>> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            invites::list(conn, &caller, server_id)
        })
    }

    pub fn revoke_invite(&self, identity: &Identity, id: &Uuid) -> Result<Invite> {
        let invite = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            invites::revoke(conn, &caller, id)
        })?;
        self.publish(Change::server(invite.server_id));
        Ok(invite)
    }

    // direct messages

    pub fn create_dm(&self, identity: &Identity, username: &str) -> Result<Uuid> {
        let now = self.now();
        let (id, members) = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            let id = dms::create(conn, &caller, username, now)?;
            Ok((id, dms::members(conn, &id)?))
        })?;
        for member in members {
            self.publish(Change::user(member.id));
        }
        Ok(id)
    }

    pub fn list_dms(&self, identity: &Identity) -> Result<Vec<DirectMessageView>> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            dms::list(conn, &caller)
        })
    }

    pub fn get_dm(&self, identity: &Identity, id: &Uuid) -> Result<DirectMessageView> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            dms::get(conn, &caller, id)
        })
    }

    // messages and attachments

    pub fn list_messages(
        &self,
        identity: &Identity,
        conversation: ConversationRef,
        before: Option<&Uuid>,
        limit: usize,
    ) -> Result<Vec<MessageView>> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            messages::list(conn, &caller, conversation, before, limit, |blob| {
                self.url_string(blob)
            })
        })
    }

    pub fn send_message(
        &self,
        identity: &Identity,
        conversation: ConversationRef,
        content: &str,
        attachment: Option<BlobRef>,
    ) -> Result<Message> {
        let now = self.now();
        let message = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            let message = messages::create(conn, &caller, conversation, content, attachment, now)?;
            // rolls the insert back when the upload is not the caller's
            if let Some(blob) = &attachment {
                self.check_upload(&caller, blob, "attachment")?;
            }
            Ok(message)
        })?;
        self.wake.notify_one();
        self.publish(Change::conversation(conversation));
        Ok(message)
    }

    /// Delete one of the caller's messages, then its attachment unless
    /// another message or a server icon still uses it.
    pub fn remove_message(&self, identity: &Identity, id: &Uuid) -> Result<Message> {
        let (message, unused) = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            let message = messages::remove(conn, &caller, id)?;
            let unused = unreferenced(conn, message.attachment)?;
            Ok((message, unused))
        })?;
        for blob in &unused {
            self.release(blob);
        }
        self.publish(Change::conversation(message.conversation));
        Ok(message)
    }

    pub fn upload_url(&self, identity: &Identity) -> Result<Url> {
        let caller = self.me(identity)?;
        self.blobs.generate_upload_url(caller.id)
    }

    /// Discard an upload that was never sent. Only the uploader may do this,
    /// and only while no message or server icon refers to it.
    pub fn remove_attachment(&self, identity: &Identity, blob: &BlobRef) -> Result<()> {
        // the write lock keeps a concurrent send from picking the blob up
        self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            self.check_upload(&caller, blob, "attachment")?;
            if blob_in_use(conn, blob)? {
                return Err(ChatError::InvalidInput("attachment is in use"));
            }
            self.blobs.delete(blob)
        })
    }

    // typing

    /// Mark the caller as typing. Returns the new expiry.
    pub fn start_typing(&self, identity: &Identity, conversation: ConversationRef) -> Result<i64> {
        let now = self.now();
        let expires_at = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            typing::upsert(conn, &caller, conversation, now)
        })?;
        self.wake.notify_one();
        self.publish(Change::conversation(conversation));
        Ok(expires_at)
    }

    pub fn stop_typing(&self, identity: &Identity, conversation: ConversationRef) -> Result<bool> {
        let removed = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            typing::remove(conn, &caller.id, conversation)
        })?;
        if removed {
            self.publish(Change::conversation(conversation));
        }
        Ok(removed)
    }

    pub fn typing_users(
        &self,
        identity: &Identity,
        conversation: ConversationRef,
    ) -> Result<Vec<String>> {
        let now = self.now();
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            typing::list(conn, &caller, conversation, now)
        })
    }

    // friends

    pub fn send_friend_request(&self, identity: &Identity, username: &str) -> Result<Friend> {
        let now = self.now();
        let friend = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            friends::request(conn, &caller, username, now)
        })?;
        self.publish(Change::friends(friend.requester_id));
        self.publish(Change::friends(friend.addressee_id));
        Ok(friend)
    }

    pub fn pending_friends(&self, identity: &Identity) -> Result<Vec<FriendView>> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            friends::list_pending(conn, &caller)
        })
    }

    pub fn friends(&self, identity: &Identity) -> Result<Vec<FriendView>> {
        self.read(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            friends::list_accepted(conn, &caller)
        })
    }

    pub fn update_friend(
        &self,
        identity: &Identity,
        id: &Uuid,
        status: FriendStatus,
    ) -> Result<Friend> {
        let friend = self.write(|conn| {
            let caller = guard::resolve_caller(conn, identity)?;
            friends::update_status(conn, &caller, id, status)
        })?;
        self.publish(Change::friends(friend.requester_id));
        self.publish(Change::friends(friend.addressee_id));
        Ok(friend)
    }

    // deferred work

    /// Execute every job that is due, each in its own transaction.
    /// Returns how many jobs were taken off the queue.
    pub fn run_due_jobs(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let now = self.now();
            let pass = self.write(|conn| {
                let Some(job) = scheduler::next_due(conn, now)? else {
                    return Ok(None);
                };
                let task = match &job.task {
                    Ok(task) => task,
                    Err(e) => {
                        warn!(job = job.id, "dropping undecodable job: {e}");
                        scheduler::complete(conn, job.id)?;
                        return Ok(Some(None));
                    }
                };
                match execute(conn, task) {
                    Ok(change) => {
                        scheduler::complete(conn, job.id)?;
                        Ok(Some(change))
                    }
                    Err(e) => {
                        if scheduler::retry(conn, &job, now)? {
                            warn!(job = job.id, attempts = job.attempts + 1, "job failed, will retry: {e}");
                        } else {
                            error!(job = job.id, "job failed for the last time, dropping: {e}");
                        }
                        Ok(Some(None))
                    }
                }
            })?;
            match pass {
                None => break,
                Some(change) => {
                    handled += 1;
                    if let Some(change) = change {
                        self.publish(change);
                    }
                }
            }
        }
        if handled > 0 {
            debug!(handled, "ran scheduled jobs");
        }
        Ok(handled)
    }

    /// Run scheduled jobs forever. Sleeps until the next job is due, at most
    /// a second, or until new work is scheduled.
    pub async fn run_dispatcher(self: Arc<Self>) {
        info!("job dispatcher started");
        loop {
            if let Err(e) = self.run_due_jobs() {
                error!("job dispatch failed: {e}");
            }
            let wait = match self.read(scheduler::next_run_at) {
                Ok(Some(at)) => (at - self.now()).clamp(0, DISPATCH_IDLE_MS),
                Ok(None) => DISPATCH_IDLE_MS,
                Err(e) => {
                    warn!("could not read job queue: {e}");
                    DISPATCH_IDLE_MS
                }
            };
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
            }
        }
    }

    /// Jobs still queued, due or not.
    pub fn pending_jobs(&self) -> Result<i64> {
        self.read(scheduler::pending_count)
    }

    pub fn purge_expired_typing(&self) -> Result<usize> {
        let now = self.now();
        self.write(|conn| typing::purge_expired(conn, now))
    }

    /// Blobs still referenced by a message or a server icon.
    pub fn referenced_blobs(&self) -> Result<HashSet<BlobRef>> {
        self.read(|conn| {
            let mut refs: HashSet<BlobRef> = messages::attachment_refs(conn)?.into_iter().collect();
            refs.extend(servers::icon_refs(conn)?);
            Ok(refs)
        })
    }
}

/// Whether any message or server icon still points at `blob`.
fn blob_in_use(conn: &Connection, blob: &BlobRef) -> Result<bool> {
    let used = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM messages WHERE attachment_id = ?1) \
         OR EXISTS(SELECT 1 FROM servers WHERE icon_id = ?1)",
        [blob.to_string()],
        |row| row.get(0),
    )?;
    Ok(used)
}

/// The blobs among `blobs` nothing refers to any more, without duplicates.
fn unreferenced(
    conn: &Connection,
    blobs: impl IntoIterator<Item = BlobRef>,
) -> Result<Vec<BlobRef>> {
    let mut out = Vec::new();
    for blob in blobs {
        if !out.contains(&blob) && !blob_in_use(conn, &blob)? {
            out.push(blob);
        }
    }
    Ok(out)
}

fn execute(conn: &Connection, task: &Task) -> Result<Option<Change>> {
    match task {
        Task::RemoveTypingIndicator {
            user_id,
            conversation,
            expires_at,
        } => {
            let removed = typing::expire(conn, user_id, *conversation, *expires_at)?;
            Ok(removed.then(|| Change::conversation(*conversation)))
        }
    }
}
