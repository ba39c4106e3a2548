//! Coordination store shared between processes through one SQLite file.
//!
//! Every trait method runs inside a single `BEGIN IMMEDIATE` transaction. The
//! write lock is taken up front, so two instances can never interleave a read
//! and a write on the same key.

use super::{
    parse_bucket, step_bucket, BucketParams, CoordinationStore, StoreError, TokenGrant,
    FIELD_LAST_REFILL, FIELD_TOKENS,
};
use crate::model::now_ms;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS kv_hash (key TEXT NOT NULL, field TEXT NOT NULL, value TEXT NOT NULL, \
     PRIMARY KEY (key, field))",
    "CREATE TABLE IF NOT EXISTS kv_list (key TEXT NOT NULL, seq INTEGER NOT NULL, value TEXT NOT NULL, \
     PRIMARY KEY (key, seq))",
    "CREATE TABLE IF NOT EXISTS kv_expiry (key TEXT PRIMARY KEY, expires_at INTEGER NOT NULL)",
];

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the store file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&pool).await?;
        }
        debug!(path = %path.display(), "coordination store opened");
        Ok(Self { pool })
    }
}

async fn begin(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(())
}

async fn finish<T>(
    conn: &mut SqliteConnection,
    res: Result<T, StoreError>,
) -> Result<T, StoreError> {
    match res {
        Ok(v) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => Ok(v),
            Err(err) => {
                // SQLite keeps the transaction open when COMMIT fails; the
                // pooled connection must not go back with it.
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err.into())
            }
        },
        Err(err) => {
            // The original error matters more than a failed rollback.
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(err)
        }
    }
}

/// Drop every trace of `key` if its expiry has passed.
async fn purge_expired(conn: &mut SqliteConnection, key: &str) -> Result<(), StoreError> {
    let expires_at: Option<i64> =
        sqlx::query_scalar("SELECT expires_at FROM kv_expiry WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    if expires_at.is_some_and(|at| at <= now_ms()) {
        remove_key(conn, key).await?;
    }
    Ok(())
}

async fn remove_key(conn: &mut SqliteConnection, key: &str) -> Result<(), StoreError> {
    for sql in [
        "DELETE FROM kv_hash WHERE key = ?",
        "DELETE FROM kv_list WHERE key = ?",
        "DELETE FROM kv_expiry WHERE key = ?",
    ] {
        sqlx::query(sql).bind(key).execute(&mut *conn).await?;
    }
    Ok(())
}

async fn set_expiry(conn: &mut SqliteConnection, key: &str, ttl: Duration) -> Result<(), StoreError> {
    let expires_at = now_ms().saturating_add(ttl.as_millis() as i64);
    sqlx::query(
        "INSERT INTO kv_expiry (key, expires_at) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
    )
    .bind(key)
    .bind(expires_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn read_field(
    conn: &mut SqliteConnection,
    key: &str,
    field: &str,
) -> Result<Option<String>, StoreError> {
    Ok(
        sqlx::query_scalar("SELECT value FROM kv_hash WHERE key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

async fn write_field(
    conn: &mut SqliteConnection,
    key: &str,
    field: &str,
    value: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO kv_hash (key, field, value) VALUES (?, ?, ?) \
         ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(field)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn list_len(conn: &mut SqliteConnection, key: &str) -> Result<usize, StoreError> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_list WHERE key = ?")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    Ok(n as usize)
}

async fn take_token_tx(
    conn: &mut SqliteConnection,
    key: &str,
    params: &BucketParams,
    now: i64,
) -> Result<TokenGrant, StoreError> {
    purge_expired(conn, key).await?;
    let tokens = read_field(conn, key, FIELD_TOKENS).await?;
    let last_refill = read_field(conn, key, FIELD_LAST_REFILL).await?;
    let current = parse_bucket(key, tokens.as_deref(), last_refill.as_deref())?;

    let grant = step_bucket(current, params, now);
    write_field(conn, key, FIELD_TOKENS, &grant.state.tokens.to_string()).await?;
    write_field(
        conn,
        key,
        FIELD_LAST_REFILL,
        &grant.state.last_refill_ms.to_string(),
    )
    .await?;
    set_expiry(conn, key, params.ttl).await?;
    Ok(grant)
}

async fn push_back_tx(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
    ttl: Duration,
) -> Result<usize, StoreError> {
    purge_expired(conn, key).await?;
    let tail: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM kv_list WHERE key = ?")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    sqlx::query("INSERT INTO kv_list (key, seq, value) VALUES (?, ?, ?)")
        .bind(key)
        .bind(tail.unwrap_or(0) + 1)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    set_expiry(conn, key, ttl).await?;
    list_len(conn, key).await
}

async fn push_front_tx(
    conn: &mut SqliteConnection,
    key: &str,
    values: &[String],
    ttl: Duration,
) -> Result<usize, StoreError> {
    purge_expired(conn, key).await?;
    let head: Option<i64> = sqlx::query_scalar("SELECT MIN(seq) FROM kv_list WHERE key = ?")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?;
    let start = head.unwrap_or(1) - values.len() as i64;
    for (i, value) in values.iter().enumerate() {
        sqlx::query("INSERT INTO kv_list (key, seq, value) VALUES (?, ?, ?)")
            .bind(key)
            .bind(start + i as i64)
            .bind(value)
            .execute(&mut *conn)
            .await?;
    }
    set_expiry(conn, key, ttl).await?;
    list_len(conn, key).await
}

async fn pop_front_tx(
    conn: &mut SqliteConnection,
    key: &str,
    max: usize,
) -> Result<Vec<String>, StoreError> {
    purge_expired(conn, key).await?;
    let rows = sqlx::query("SELECT seq, value FROM kv_list WHERE key = ? ORDER BY seq ASC LIMIT ?")
        .bind(key)
        .bind(max as i64)
        .fetch_all(&mut *conn)
        .await?;
    let Some(last_seq) = rows.last().map(|r| r.get::<i64, _>("seq")) else {
        return Ok(Vec::new());
    };
    sqlx::query("DELETE FROM kv_list WHERE key = ? AND seq <= ?")
        .bind(key)
        .bind(last_seq)
        .execute(&mut *conn)
        .await?;
    if list_len(conn, key).await? == 0 {
        remove_key(conn, key).await?;
    }
    Ok(rows.iter().map(|r| r.get::<String, _>("value")).collect())
}

async fn front_tx(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>, StoreError> {
    purge_expired(conn, key).await?;
    Ok(
        sqlx::query_scalar("SELECT value FROM kv_list WHERE key = ? ORDER BY seq ASC LIMIT 1")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn take_token(
        &self,
        key: &str,
        params: &BucketParams,
        now_ms: i64,
    ) -> Result<TokenGrant, StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = take_token_tx(&mut conn, key, params, now_ms).await;
        finish(&mut conn, res).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = async {
            purge_expired(&mut conn, key).await?;
            read_field(&mut conn, key, field).await
        }
        .await;
        finish(&mut conn, res).await
    }

    async fn push_back(&self, key: &str, value: String, ttl: Duration) -> Result<usize, StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = push_back_tx(&mut conn, key, &value, ttl).await;
        finish(&mut conn, res).await
    }

    async fn push_front(
        &self,
        key: &str,
        values: Vec<String>,
        ttl: Duration,
    ) -> Result<usize, StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = push_front_tx(&mut conn, key, &values, ttl).await;
        finish(&mut conn, res).await
    }

    async fn pop_front(&self, key: &str, max: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = pop_front_tx(&mut conn, key, max).await;
        finish(&mut conn, res).await
    }

    async fn len(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = async {
            purge_expired(&mut conn, key).await?;
            list_len(&mut conn, key).await
        }
        .await;
        finish(&mut conn, res).await
    }

    async fn front(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = front_tx(&mut conn, key).await;
        finish(&mut conn, res).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        begin(&mut conn).await?;
        let res = remove_key(&mut conn, key).await;
        finish(&mut conn, res).await
    }
}
