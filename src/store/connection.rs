//! Connection/retry helper: every access to the
//! vulnerability store's on-disk database goes through `with_transaction`,
//! which enables WAL mode, sets a busy-timeout, retries transient "database
//! is locked" errors up to three times with jittered exponential backoff,
//! and commits on success / rolls back on any error.

use crate::error::{Error, Result};
use rand::Rng;
use rusqlite::Connection;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RETRIES: u32 = 3;
const BASE_BACKOFFS_MS: [u64; 3] = [100, 200, 400];

pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Runs `f` inside a transaction, committing on `Ok` and rolling back on
/// `Err`. `f` returns the raw `rusqlite::Result` so lock contention can be
/// told apart from every other failure; non-lock errors are surfaced
/// immediately, a lock error is retried up to `MAX_RETRIES` times with
/// jittered backoff before being surfaced as `Error::Conflict`.
pub fn with_transaction<T>(
    conn: &mut Connection,
    mut f: impl FnMut(&rusqlite::Transaction) -> rusqlite::Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        let tx = conn.transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                return Ok(value);
            }
            Err(e) if is_locked(&e) && attempt < MAX_RETRIES => {
                let _ = tx.rollback();
                attempt += 1;
                backoff(attempt);
                continue;
            }
            Err(e) if is_locked(&e) => {
                let _ = tx.rollback();
                return Err(Error::Conflict(format!("database locked after {MAX_RETRIES} retries: {e}")));
            }
            Err(e) => {
                let _ = tx.rollback();
                return Err(e.into());
            }
        }
    }
}

/// Lower-level retry wrapper for a single statement outside a transaction
/// (e.g. a read), using the same lock-detection and backoff policy.
pub fn retry_on_lock<T>(mut f: impl FnMut() -> rusqlite::Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(v) => return Ok(v),
            Err(e) if is_locked(&e) && attempt < MAX_RETRIES => {
                backoff(attempt);
                attempt += 1;
            }
            Err(e) if is_locked(&e) => {
                return Err(Error::Conflict(format!("database locked after {MAX_RETRIES} retries: {e}")));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn backoff(attempt: u32) {
    let base = BASE_BACKOFFS_MS[attempt.min(BASE_BACKOFFS_MS.len() as u32 - 1) as usize];
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    sleep(Duration::from_millis(base + jitter));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_configures_wal_and_timeout() {
        let conn = open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (id INTEGER)", []).unwrap();
    }

    #[test]
    fn retry_on_lock_succeeds_first_try_without_sleeping() {
        let result: Result<i32> = retry_on_lock(|| Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn retry_on_lock_surfaces_non_lock_errors_immediately() {
        let mut calls = 0;
        let result: Result<()> = retry_on_lock(|| {
            calls += 1;
            Err(rusqlite::Error::InvalidQuery)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
