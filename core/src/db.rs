use crate::error::Result;
use crate::model::ConversationRef;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open a single connection and apply the schema. Used by unit tests and tooling.
pub fn init_db<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    configure(&mut conn)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Build a connection pool over the database file, or over a private
/// in-memory database when `path` is `None`.
pub fn open_pool(path: Option<&Path>) -> Result<DbPool> {
    let pool = match path {
        Some(path) => {
            let manager = SqliteConnectionManager::file(path).with_init(configure);
            Pool::builder().build(manager)?
        }
        None => {
            // an in-memory database lives as long as its only connection
            let manager = SqliteConnectionManager::memory().with_init(configure);
            Pool::builder()
                .max_size(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .build(manager)?
        }
    };
    pool.get()?.execute_batch(SCHEMA)?;
    Ok(pool)
}

fn configure(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

/// Resolve the conversation variant from whichever owning column is present.
pub(crate) fn conversation_at(
    row: &Row<'_>,
    dm_idx: usize,
    channel_idx: usize,
) -> rusqlite::Result<ConversationRef> {
    match (opt_uuid_at(row, dm_idx)?, opt_uuid_at(row, channel_idx)?) {
        (Some(dm), None) => Ok(ConversationRef::DirectMessage(dm)),
        (None, Some(channel)) => Ok(ConversationRef::Channel(channel)),
        _ => Err(rusqlite::Error::FromSqlConversionFailure(
            dm_idx,
            Type::Null,
            "row must reference exactly one of dm_id or channel_id".into(),
        )),
    }
}

/// SQL predicate matching rows of one conversation; binds `?1` and `?2`.
pub(crate) const CONVERSATION_MATCH: &str = "dm_id IS ?1 AND channel_id IS ?2";

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  external_id TEXT UNIQUE NOT NULL,
  username TEXT UNIQUE NOT NULL,
  image_url TEXT
);

CREATE TABLE IF NOT EXISTS servers (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  owner_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  icon_id TEXT,
  default_channel_id TEXT NOT NULL,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS channels (
  id TEXT PRIMARY KEY,
  server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
  name TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  UNIQUE(server_id, name)
);

CREATE TABLE IF NOT EXISTS server_members (
  server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  PRIMARY KEY (server_id, user_id)
);
CREATE INDEX IF NOT EXISTS server_members_user ON server_members(user_id);

CREATE TABLE IF NOT EXISTS direct_messages (
  id TEXT PRIMARY KEY,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dm_members (
  dm_id TEXT NOT NULL REFERENCES direct_messages(id) ON DELETE CASCADE,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  PRIMARY KEY (dm_id, user_id)
);
CREATE INDEX IF NOT EXISTS dm_members_user ON dm_members(user_id);

CREATE TABLE IF NOT EXISTS invites (
  id TEXT PRIMARY KEY,
  server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
  created_by TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  expires_at INTEGER,
  max_uses INTEGER,
  uses INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  dm_id TEXT REFERENCES direct_messages(id) ON DELETE CASCADE,
  channel_id TEXT REFERENCES channels(id) ON DELETE CASCADE,
  sender_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  content TEXT NOT NULL,
  attachment_id TEXT,
  created_at INTEGER NOT NULL,
  CHECK ((dm_id IS NULL) <> (channel_id IS NULL))
);
CREATE INDEX IF NOT EXISTS messages_dm ON messages(dm_id, created_at);
CREATE INDEX IF NOT EXISTS messages_channel ON messages(channel_id, created_at);

CREATE TABLE IF NOT EXISTS typing_indicators (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  dm_id TEXT REFERENCES direct_messages(id) ON DELETE CASCADE,
  channel_id TEXT REFERENCES channels(id) ON DELETE CASCADE,
  expires_at INTEGER NOT NULL,
  CHECK ((dm_id IS NULL) <> (channel_id IS NULL))
);
CREATE UNIQUE INDEX IF NOT EXISTS typing_user_conversation
  ON typing_indicators(user_id, COALESCE(dm_id, channel_id));

CREATE TABLE IF NOT EXISTS friends (
  id TEXT PRIMARY KEY,
  requester_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  addressee_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  status TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'rejected')),
  created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS friends_pair
  ON friends(MIN(requester_id, addressee_id), MAX(requester_id, addressee_id));

CREATE TABLE IF NOT EXISTS scheduled_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_at INTEGER NOT NULL,
  task TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS scheduled_jobs_run_at ON scheduled_jobs(run_at);
"#;
