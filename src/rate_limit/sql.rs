//! Permit stores backed by a shared SQL database via `sqlx`.
//!
//! Every acquire runs one transaction holding two statements: a purge of
//! expired rows for the key, then a conditional `INSERT ... SELECT ... WHERE`
//! that only writes when the budget still has room. The check and the write
//! are one statement, so concurrent writers in other processes cannot both
//! slip past the budget.
//!
//! Table layout:
//!
//! ```sql
//! CREATE TABLE ratelimit (
//!     cid       INT,      -- scope id
//!     userId    INT,      -- subject id
//!     id        VARCHAR,  -- limiter id
//!     timestamp BIGINT,   -- grant time, epoch millis
//!     permits   BIGINT,   -- units granted
//!     PRIMARY KEY (cid, userId, id, timestamp)
//! )
//! ```

use std::time::Duration;

use crate::error::StoreError;
use crate::rate_limit::store::{window_floor, AcquireOutcome};

/// Map the insert result onto an outcome, treating a duplicate key as a
/// timestamp collision.
fn classify_insert(
    result: Result<u64, sqlx::Error>,
) -> Result<AcquireOutcome, StoreError> {
    match result {
        Ok(1) => Ok(AcquireOutcome::Granted),
        Ok(_) => Ok(AcquireOutcome::Exhausted),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            Ok(AcquireOutcome::Collision)
        }
        Err(e) => Err(StoreError::Database(e)),
    }
}

/// Window floor as a bindable column value.
///
/// Stored stamps are never negative, so `-1` keeps every row live until the
/// window reaches past the epoch.
fn floor_column(now_millis: u64, timeframe: Duration) -> Result<i64, StoreError> {
    match window_floor(now_millis, timeframe) {
        Some(floor) => StoreError::to_column("timestamp", floor),
        None => Ok(-1),
    }
}

fn sum_to_permits(sum: i64) -> Result<u64, StoreError> {
    u64::try_from(sum).map_err(|_| StoreError::Corrupt(format!("negative permit sum {sum}")))
}

#[cfg(feature = "sqlite")]
pub use self::sqlite::SqlitePermitStore;

#[cfg(feature = "postgres")]
pub use self::postgres::PgPermitStore;

#[cfg(feature = "sqlite")]
mod sqlite {
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePool;
    use std::time::Duration;

    use super::{classify_insert, floor_column, sum_to_permits};
    use crate::error::StoreError;
    use crate::rate_limit::store::{AcquireOutcome, PermitStore};
    use crate::rate_limit::{Budget, LimiterKey};

    const SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS ratelimit (
            cid       INTEGER      NOT NULL,
            userId    INTEGER      NOT NULL,
            id        VARCHAR(128) NOT NULL,
            timestamp BIGINT       NOT NULL,
            permits   BIGINT       NOT NULL,
            PRIMARY KEY (cid, userId, id, timestamp)
        )
    "#;

    const PURGE: &str = r#"
        DELETE FROM ratelimit
        WHERE cid = ? AND userId = ? AND id = ? AND timestamp <= ?
    "#;

    const CONDITIONAL_INSERT: &str = r#"
        INSERT INTO ratelimit (cid, userId, id, timestamp, permits)
        SELECT ?, ?, ?, ?, ?
        WHERE ? - ? >= (
            SELECT COALESCE(SUM(permits), 0) FROM ratelimit
            WHERE cid = ? AND userId = ? AND id = ? AND timestamp > ?
        )
    "#;

    const LIVE_SUM: &str = r#"
        SELECT COALESCE(SUM(permits), 0) FROM ratelimit
        WHERE cid = ? AND userId = ? AND id = ? AND timestamp > ?
    "#;

    /// Permit store over a SQLite pool.
    #[derive(Clone, Debug)]
    pub struct SqlitePermitStore {
        pool: SqlitePool,
    }

    impl SqlitePermitStore {
        pub fn new(pool: SqlitePool) -> Self {
            Self { pool }
        }

        /// Create the `ratelimit` table if it does not exist yet.
        pub async fn create_schema(&self) -> Result<(), StoreError> {
            sqlx::query(SCHEMA).execute(&self.pool).await?;
            Ok(())
        }

        pub fn pool(&self) -> &SqlitePool {
            &self.pool
        }
    }

    #[async_trait]
    impl PermitStore for SqlitePermitStore {
        type Error = StoreError;

        async fn try_acquire(
            &self,
            key: &LimiterKey,
            budget: &Budget,
            permits: u64,
            now_millis: u64,
        ) -> Result<AcquireOutcome, Self::Error> {
            let now = StoreError::to_column("timestamp", now_millis)?;
            let floor = floor_column(now_millis, budget.timeframe())?;
            let permits = StoreError::to_column("permits", permits)?;
            let amount = StoreError::to_column("amount", budget.amount())?;

            let mut tx = self.pool.begin().await?;

            sqlx::query(PURGE)
                .bind(key.scope)
                .bind(key.subject)
                .bind(&key.limiter_id)
                .bind(floor)
                .execute(&mut *tx)
                .await?;

            let inserted = sqlx::query(CONDITIONAL_INSERT)
                .bind(key.scope)
                .bind(key.subject)
                .bind(&key.limiter_id)
                .bind(now)
                .bind(permits)
                .bind(amount)
                .bind(permits)
                .bind(key.scope)
                .bind(key.subject)
                .bind(&key.limiter_id)
                .bind(floor)
                .execute(&mut *tx)
                .await
                .map(|done| done.rows_affected());

            let outcome = classify_insert(inserted)?;
            if outcome == AcquireOutcome::Collision {
                // dropping the transaction rolls it back
                return Ok(outcome);
            }
            tx.commit().await?;
            Ok(outcome)
        }

        async fn live_permits(
            &self,
            key: &LimiterKey,
            timeframe: Duration,
            now_millis: u64,
        ) -> Result<u64, Self::Error> {
            let floor = floor_column(now_millis, timeframe)?;
            let sum: i64 = sqlx::query_scalar(LIVE_SUM)
                .bind(key.scope)
                .bind(key.subject)
                .bind(&key.limiter_id)
                .bind(floor)
                .fetch_one(&self.pool)
                .await?;
            sum_to_permits(sum)
        }
    }
}

#[cfg(feature = "postgres")]
mod postgres {
    use async_trait::async_trait;
    use sqlx::postgres::PgPool;
    use std::time::Duration;

    use super::{classify_insert, floor_column, sum_to_permits};
    use crate::error::StoreError;
    use crate::rate_limit::store::{AcquireOutcome, PermitStore};
    use crate::rate_limit::{Budget, LimiterKey};

    const SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS ratelimit (
            cid       INT4         NOT NULL,
            userId    INT4         NOT NULL,
            id        VARCHAR(128) NOT NULL,
            timestamp INT8         NOT NULL,
            permits   INT8         NOT NULL,
            PRIMARY KEY (cid, userId, id, timestamp)
        )
    "#;

    const PURGE: &str = r#"
        DELETE FROM ratelimit
        WHERE cid = $1 AND userId = $2 AND id = $3 AND timestamp <= $4
    "#;

    const CONDITIONAL_INSERT: &str = r#"
        INSERT INTO ratelimit (cid, userId, id, timestamp, permits)
        SELECT $1::INT4, $2::INT4, $3::VARCHAR, $4::INT8, $5::INT8
        WHERE $6::INT8 - $5::INT8 >= (
            SELECT COALESCE(SUM(permits), 0)::INT8 FROM ratelimit
            WHERE cid = $1 AND userId = $2 AND id = $3 AND timestamp > $7
        )
    "#;

    const LIVE_SUM: &str = r#"
        SELECT COALESCE(SUM(permits), 0)::INT8 FROM ratelimit
        WHERE cid = $1 AND userId = $2 AND id = $3 AND timestamp > $4
    "#;

    /// Permit store over a PostgreSQL pool.
    ///
    /// Transactions run at `SERIALIZABLE`: under `READ COMMITTED` two
    /// concurrent conditional inserts would both read the same sum. A
    /// serialization failure surfaces as a [`StoreError`] and the limiter
    /// denies.
    #[derive(Clone, Debug)]
    pub struct PgPermitStore {
        pool: PgPool,
    }

    impl PgPermitStore {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        /// Create the `ratelimit` table if it does not exist yet.
        pub async fn create_schema(&self) -> Result<(), StoreError> {
            sqlx::query(SCHEMA).execute(&self.pool).await?;
            Ok(())
        }

        pub fn pool(&self) -> &PgPool {
            &self.pool
        }
    }

    #[async_trait]
    impl PermitStore for PgPermitStore {
        type Error = StoreError;

        async fn try_acquire(
            &self,
            key: &LimiterKey,
            budget: &Budget,
            permits: u64,
            now_millis: u64,
        ) -> Result<AcquireOutcome, Self::Error> {
            let now = StoreError::to_column("timestamp", now_millis)?;
            let floor = floor_column(now_millis, budget.timeframe())?;
            let permits = StoreError::to_column("permits", permits)?;
            let amount = StoreError::to_column("amount", budget.amount())?;

            let mut tx = self.pool.begin().await?;

            sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
                .execute(&mut *tx)
                .await?;

            sqlx::query(PURGE)
                .bind(key.scope)
                .bind(key.subject)
                .bind(&key.limiter_id)
                .bind(floor)
                .execute(&mut *tx)
                .await?;

            let inserted = sqlx::query(CONDITIONAL_INSERT)
                .bind(key.scope)
                .bind(key.subject)
                .bind(&key.limiter_id)
                .bind(now)
                .bind(permits)
                .bind(amount)
                .bind(floor)
                .execute(&mut *tx)
                .await
                .map(|done| done.rows_affected());

            let outcome = classify_insert(inserted)?;
            if outcome == AcquireOutcome::Collision {
                // the failed statement aborted the transaction; drop rolls back
                return Ok(outcome);
            }
            tx.commit().await?;
            Ok(outcome)
        }

        async fn live_permits(
            &self,
            key: &LimiterKey,
            timeframe: Duration,
            now_millis: u64,
        ) -> Result<u64, Self::Error> {
            let floor = floor_column(now_millis, timeframe)?;
            let sum: i64 = sqlx::query_scalar(LIVE_SUM)
                .bind(key.scope)
                .bind(key.subject)
                .bind(&key.limiter_id)
                .bind(floor)
                .fetch_one(&self.pool)
                .await?;
            sum_to_permits(sum)
        }
    }
}
