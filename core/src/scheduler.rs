//! Durable deferred tasks.
//!
//! Jobs are rows written on the caller's connection, so scheduling commits
//! or rolls back together with the write that asked for it. Delivery is
//! at-least-once; tasks must tolerate late and repeated execution.

use crate::error::Result;
use crate::model::ConversationRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Jobs that keep failing are dropped after this many attempts.
pub const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Delete a typing indicator. With `expires_at` set, only an indicator
    /// still carrying that exact expiry is deleted.
    RemoveTypingIndicator {
        user_id: Uuid,
        conversation: ConversationRef,
        expires_at: Option<i64>,
    },
}

/// A stored job whose payload could not be decoded is surfaced as `Err`.
#[derive(Debug)]
pub struct Job {
    pub id: i64,
    pub run_at: i64,
    pub attempts: u32,
    pub task: std::result::Result<Task, serde_json::Error>,
}

/// Schedule `task` to run at the absolute time `at` (epoch ms).
pub fn run_at(conn: &Connection, at: i64, task: &Task) -> Result<i64> {
    let payload = serde_json::to_string(task)?;
    conn.execute(
        "INSERT INTO scheduled_jobs (run_at, task) VALUES (?1, ?2)",
        params![at, payload],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Schedule `task` to run `delay_ms` after `now`.
pub fn run_after(conn: &Connection, now: i64, delay_ms: i64, task: &Task) -> Result<i64> {
    run_at(conn, now + delay_ms.max(0), task)
}

/// The earliest job that is due at `now`.
pub fn next_due(conn: &Connection, now: i64) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            "SELECT id, run_at, attempts, task FROM scheduled_jobs WHERE run_at <= ?1 ORDER BY run_at, id LIMIT 1",
            [now],
            |row| {
                let payload: String = row.get(3)?;
                Ok(Job {
                    id: row.get(0)?,
                    run_at: row.get(1)?,
                    attempts: row.get(2)?,
                    task: serde_json::from_str(&payload),
                })
            },
        )
        .optional()?;
    Ok(job)
}

/// When the next job becomes due, if any are queued.
pub fn next_run_at(conn: &Connection) -> Result<Option<i64>> {
    let at: Option<i64> = conn.query_row("SELECT MIN(run_at) FROM scheduled_jobs", [], |row| {
        row.get(0)
    })?;
    Ok(at)
}

pub fn complete(conn: &Connection, job_id: i64) -> Result<()> {
    conn.execute("DELETE FROM scheduled_jobs WHERE id = ?1", [job_id])?;
    Ok(())
}

/// Push a failed job back with linear backoff. Returns false once the job
/// ran out of attempts and was dropped.
pub fn retry(conn: &Connection, job: &Job, now: i64) -> Result<bool> {
    let attempts = job.attempts + 1;
    if attempts >= MAX_ATTEMPTS {
        complete(conn, job.id)?;
        return Ok(false);
    }
    conn.execute(
        "UPDATE scheduled_jobs SET attempts = ?2, run_at = ?3 WHERE id = ?1",
        params![job.id, attempts, now + 1_000 * i64::from(attempts)],
    )?;
    Ok(true)
}

pub fn pending_count(conn: &Connection) -> Result<i64> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM scheduled_jobs", [], |row| row.get(0))?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn task() -> Task {
        Task::RemoveTypingIndicator {
            user_id: Uuid::nil(),
            conversation: ConversationRef::Channel(Uuid::nil()),
            expires_at: Some(42),
        }
    }

    #[test]
    fn due_jobs_come_out_in_run_order() {
        let conn = db::init_db(":memory:").unwrap();
        let late = run_at(&conn, 200, &task()).unwrap();
        let early = run_after(&conn, 50, 50, &task()).unwrap();
        assert!(next_due(&conn, 99).unwrap().is_none());
        assert_eq!(next_run_at(&conn).unwrap(), Some(100));

        let job = next_due(&conn, 1_000).unwrap().unwrap();
        assert_eq!(job.id, early);
        assert_eq!(job.task.unwrap(), task());
        complete(&conn, early).unwrap();
        assert_eq!(next_due(&conn, 1_000).unwrap().unwrap().id, late);
    }

    #[test]
    fn retry_backs_off_then_gives_up() {
        let conn = db::init_db(":memory:").unwrap();
        run_at(&conn, 0, &task()).unwrap();
        for round in 1..MAX_ATTEMPTS {
            let job = next_due(&conn, i64::MAX).unwrap().unwrap();
            assert!(retry(&conn, &job, 0).unwrap());
            assert_eq!(next_run_at(&conn).unwrap(), Some(1_000 * i64::from(round)));
        }
        let job = next_due(&conn, i64::MAX).unwrap().unwrap();
        assert!(!retry(&conn, &job, 0).unwrap());
        assert_eq!(pending_count(&conn).unwrap(), 0);
    }

    #[test]
    fn task_wire_format_is_tagged() {
        let json = serde_json::to_value(task()).unwrap();
        assert_eq!(json["task"], "remove_typing_indicator");
        assert_eq!(json["conversation"]["kind"], "channel");
    }
}
