//! Postgres-backed record store.
//!
//! Records live as JSONB documents in a single table keyed by their store key. The
//! lease columns implement per-key locking: a lock is taken with a conditional
//! `UPDATE` that only succeeds when no lease is held or the held lease has expired.
//! Lease expiry is computed with the database clock so that every worker agrees on it.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | Database (any code) | `Storage` |
//! | PoolClosed | `Storage` |
//! | Decode / ColumnDecode | `Serialization` |
//! | Other | `Storage` |

use std::sync::Arc;

use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{instrument, Span};

use chunkline_core::{BatchKey, BatchRecord, LeaseToken};

use super::r#trait::{IfMissing, LockMode, LockedRecord, Lookup, RecordStore, StoreConfig, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch_records (
    record_key       TEXT PRIMARY KEY,
    record           JSONB NOT NULL,
    lease_token      UUID NULL,
    lease_expires_at TIMESTAMPTZ NULL,
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Postgres-backed batch record store.
///
/// Cheap to clone; all clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresRecordStore {
    pool: Arc<PgPool>,
    config: StoreConfig,
}

impl PostgresRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, StoreConfig::default())
    }

    pub fn with_config(pool: PgPool, config: StoreConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            config,
        }
    }

    /// Create the backing table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn insert_if_absent(&self, record: &BatchRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batch_records (record_key, record)
            VALUES ($1, $2)
            ON CONFLICT (record_key) DO NOTHING
            "#,
        )
        .bind(record.record_key())
        .bind(Json(record))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_if_absent", e))?;
        Ok(())
    }

    async fn read(&self, record_key: &str) -> Result<Option<BatchRecord>, StoreError> {
        let row = sqlx::query("SELECT record FROM batch_records WHERE record_key = $1")
            .bind(record_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("read", e))?;

        row.map(|row| decode_record(&row)).transpose()
    }

    /// One locking attempt. `Ok(None)` means the lock is currently held elsewhere.
    async fn try_lock(&self, record_key: &str) -> Result<Option<Lookup>, StoreError> {
        let token = LeaseToken::new();
        let ttl_ms = self.config.lease_ttl.as_millis() as f64;

        let row = sqlx::query(
            r#"
            UPDATE batch_records
            SET lease_token = $2,
                lease_expires_at = now() + ($3::double precision * interval '1 millisecond')
            WHERE record_key = $1
              AND (lease_token IS NULL OR lease_expires_at <= now())
            RETURNING record
            "#,
        )
        .bind(record_key)
        .bind(*token.as_uuid())
        .bind(ttl_ms)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_lock", e))?;

        if let Some(row) = row {
            return Ok(Some(Lookup::Found(LockedRecord {
                record: decode_record(&row)?,
                lease: Some(token),
            })));
        }

        let exists = sqlx::query("SELECT 1 FROM batch_records WHERE record_key = $1")
            .bind(record_key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("try_lock", e))?
            .is_some();

        Ok(if exists { None } else { Some(Lookup::Absent) })
    }
}

#[async_trait::async_trait]
impl RecordStore for PostgresRecordStore {
    #[instrument(
        skip(self),
        fields(record_key = %key.record_key(), attempts = tracing::field::Empty),
        err
    )]
    async fn find(
        &self,
        key: &BatchKey,
        mode: LockMode,
        if_missing: IfMissing,
    ) -> Result<Lookup, StoreError> {
        let record_key = key.record_key();

        if let IfMissing::Create(now) = if_missing {
            self.insert_if_absent(&BatchRecord::new(key.clone(), now)).await?;
        }

        if mode == LockMode::None {
            return Ok(match self.read(&record_key).await? {
                Some(record) => Lookup::Found(LockedRecord { record, lease: None }),
                None => Lookup::Absent,
            });
        }

        let give_up_at = Instant::now() + self.config.lock_wait;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(lookup) = self.try_lock(&record_key).await? {
                Span::current().record("attempts", attempts);
                return Ok(lookup);
            }
            if mode == LockMode::SkipIfLocked {
                return Ok(Lookup::Contended);
            }
            if Instant::now() >= give_up_at {
                return Err(StoreError::LockTimeout(record_key));
            }
            tokio::time::sleep(self.config.lock_poll).await;
        }
    }

    #[instrument(skip(self), fields(record_key = %key.record_key()), err)]
    async fn release(&self, key: &BatchKey, lease: LeaseToken) -> Result<(), StoreError> {
        let record_key = key.record_key();

        let released = sqlx::query(
            r#"
            UPDATE batch_records
            SET lease_token = NULL, lease_expires_at = NULL
            WHERE record_key = $1 AND lease_token = $2
            "#,
        )
        .bind(&record_key)
        .bind(*lease.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?
        .rows_affected();

        if released > 0 {
            return Ok(());
        }

        let held_by_other = sqlx::query(
            "SELECT 1 FROM batch_records WHERE record_key = $1 AND lease_token IS NOT NULL",
        )
        .bind(&record_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?
        .is_some();

        if held_by_other {
            Err(StoreError::LeaseMismatch(record_key))
        } else {
            Ok(())
        }
    }

    #[instrument(skip(self, record), fields(record_key = %record.record_key()), err)]
    async fn save(&self, record: &BatchRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO batch_records (record_key, record, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (record_key)
            DO UPDATE SET record = EXCLUDED.record, updated_at = now()
            "#,
        )
        .bind(record.record_key())
        .bind(Json(record))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(record_key = %key.record_key()), err)]
    async fn delete(&self, key: &BatchKey) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM batch_records WHERE record_key = $1")
            .bind(key.record_key())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?
            .rows_affected();
        Ok(deleted > 0)
    }

    #[instrument(skip(self), fields(record_count = tracing::field::Empty), err)]
    async fn find_by_key_prefix(&self, prefix: &str) -> Result<Vec<BatchRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM batch_records
            WHERE record_key LIKE $1 ESCAPE '\'
            ORDER BY record_key ASC
            "#,
        )
        .bind(format!("{}%", escape_like(prefix)))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_key_prefix", e))?;

        let records = rows
            .iter()
            .map(decode_record)
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("record_count", records.len());
        Ok(records)
    }
}

fn decode_record(row: &sqlx::postgres::PgRow) -> Result<BatchRecord, StoreError> {
    row.try_get::<Json<BatchRecord>, _>("record")
        .map(|json| json.0)
        .map_err(|e| StoreError::Serialization(format!("failed to decode record row: {e}")))
}

fn escape_like(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Storage(format!(
            "database error in {operation} ({}): {}",
            db_err.code().as_deref().unwrap_or("?"),
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Decode(e) | sqlx::Error::ColumnDecode { source: e, .. } => {
            StoreError::Serialization(format!("decode error in {operation}: {e}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(escape_like("batch-record-"), "batch-record-");
        assert_eq!(escape_like("a_b%c\\d"), "a\\_b\\%c\\\\d");
    }

    #[test]
    fn pool_closed_maps_to_storage() {
        let err = map_sqlx_error("save", sqlx::Error::PoolClosed);
        assert!(matches!(err, StoreError::Storage(msg) if msg.contains("save")));
    }
}
