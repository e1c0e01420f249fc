//! PostgreSQL storage implementation
//!
//! Records are kept as JSONB documents next to the key columns that queries,
//! indexes and uniqueness constraints need. Multi-step mutations run in one
//! transaction with `FOR UPDATE` row locks; the boost guard additionally takes
//! a transaction-scoped advisory lock so the global cap check and the insert
//! are serialized across connections.

use super::traits::*;
use super::StorageError;
use crate::activity::{ActivityEntry, ActivityQuery};
use crate::types::{
    Boost, PaymentFailureRecord, Pledge, PledgeStatus, Resource, UserAccount, WithdrawalSchedule,
    WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Advisory lock key serializing boost activation.
const BOOST_GUARD_LOCK: i64 = 0x0c0f_b005_7000;

/// PostgreSQL-backed storage
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and create the schema if it does not exist yet.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Connection(format!("postgres connect failed: {e}")))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> StorageResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS cofund_resources (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                active BOOLEAN NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cofund_pledges (
                id UUID PRIMARY KEY,
                owner_id TEXT NOT NULL,
                resource_id UUID NOT NULL,
                status TEXT NOT NULL,
                intent_id TEXT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS cofund_pledges_one_open
                ON cofund_pledges (owner_id, resource_id)
                WHERE status <> 'withdrawn'
            "#,
            "CREATE INDEX IF NOT EXISTS cofund_pledges_intent ON cofund_pledges (intent_id)",
            "CREATE INDEX IF NOT EXISTS cofund_pledges_resource ON cofund_pledges (resource_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS cofund_boosts (
                id UUID PRIMARY KEY,
                resource_id UUID NOT NULL,
                active BOOLEAN NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS cofund_boosts_live ON cofund_boosts (active, expires_at)",
            r#"
            CREATE TABLE IF NOT EXISTS cofund_payment_failures (
                user_id TEXT PRIMARY KEY,
                consecutive_failure_count INTEGER NOT NULL DEFAULT 0,
                suspended BOOLEAN NOT NULL DEFAULT FALSE,
                last_failure_at TIMESTAMPTZ NULL,
                payment_suspended_at TIMESTAMPTZ NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cofund_withdrawal_schedules (
                id UUID PRIMARY KEY,
                resource_id UUID NOT NULL,
                cycle TEXT NOT NULL,
                status TEXT NOT NULL,
                due_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL,
                UNIQUE (resource_id, cycle)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS cofund_withdrawals_due ON cofund_withdrawal_schedules (status, due_at)",
            r#"
            CREATE TABLE IF NOT EXISTS cofund_activity (
                sequence BIGSERIAL PRIMARY KEY,
                id UUID NOT NULL,
                kind TEXT NOT NULL,
                user_id TEXT NOT NULL,
                resource_id UUID NULL,
                created_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS cofund_activity_user ON cofund_activity (user_id, sequence DESC)",
            "CREATE INDEX IF NOT EXISTS cofund_activity_resource ON cofund_activity (resource_id, sequence DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS cofund_processed_payments (
                idempotency_key TEXT PRIMARY KEY,
                intent_id TEXT NOT NULL,
                event_id TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cofund_accounts (
                user_id TEXT PRIMARY KEY,
                banned BOOLEAN NOT NULL DEFAULT FALSE,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Query(format!("postgres schema create failed: {e}")))?;
        }

        Ok(())
    }
}

fn query_err(e: sqlx::Error) -> StorageError {
    StorageError::Query(e.to_string())
}

fn unique_or_query(e: sqlx::Error, conflict: impl FnOnce() -> String) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Conflict(conflict()),
        _ => query_err(e),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| StorageError::InvalidData(format!("json serialize error: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> StorageResult<T> {
    serde_json::from_value(value)
        .map_err(|e| StorageError::InvalidData(format!("json deserialize error: {e}")))
}

fn data_of<T: serde::de::DeserializeOwned>(row: &PgRow) -> StorageResult<T> {
    let data: Value = row.try_get("data").map_err(query_err)?;
    from_json(data)
}

fn decode_rows<T: serde::de::DeserializeOwned>(rows: Vec<PgRow>) -> StorageResult<Vec<T>> {
    rows.iter().map(data_of).collect()
}

fn failure_from_row(row: &PgRow) -> StorageResult<PaymentFailureRecord> {
    let count: i32 = row
        .try_get("consecutive_failure_count")
        .map_err(query_err)?;
    Ok(PaymentFailureRecord {
        user_id: row.try_get("user_id").map_err(query_err)?,
        consecutive_failure_count: u32::try_from(count).map_err(|_| {
            StorageError::InvalidData("negative failure count in storage".to_string())
        })?,
        suspended: row.try_get("suspended").map_err(query_err)?,
        last_failure_at: row.try_get("last_failure_at").map_err(query_err)?,
        payment_suspended_at: row.try_get("payment_suspended_at").map_err(query_err)?,
    })
}

async fn insert_activity(conn: &mut PgConnection, entry: &ActivityEntry) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO cofund_activity (id, kind, user_id, resource_id, created_at, data)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(entry.id)
    .bind(entry.kind.as_str())
    .bind(&entry.user_id)
    .bind(entry.resource_id)
    .bind(entry.created_at)
    .bind(to_json(entry)?)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

async fn write_pledge(conn: &mut PgConnection, pledge: &Pledge) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE cofund_pledges
        SET status = $2, intent_id = $3, data = $4, updated_at = $5
        WHERE id = $1
        "#,
    )
    .bind(pledge.id)
    .bind(pledge.status.as_str())
    .bind(&pledge.intent_id)
    .bind(to_json(pledge)?)
    .bind(pledge.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

async fn lock_pledge(conn: &mut PgConnection, pledge_id: Uuid) -> StorageResult<Pledge> {
    let row = sqlx::query("SELECT data FROM cofund_pledges WHERE id = $1 FOR UPDATE")
        .bind(pledge_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?
        .ok_or_else(|| StorageError::NotFound(format!("pledge {pledge_id}")))?;
    data_of(&row)
}

/// Lock the resource row so completions on it are serialized; `None` if it is gone.
async fn lock_capacity(conn: &mut PgConnection, resource_id: Uuid) -> StorageResult<Option<u64>> {
    let row = sqlx::query("SELECT data FROM cofund_resources WHERE id = $1 FOR UPDATE")
        .bind(resource_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?;
    let resource: Option<Resource> = row.as_ref().map(data_of).transpose()?;
    Ok(resource.map(|resource| resource.max_people()))
}

async fn lock_failure_record(
    conn: &mut PgConnection,
    user_id: &str,
) -> StorageResult<PaymentFailureRecord> {
    sqlx::query(
        "INSERT INTO cofund_payment_failures (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;

    let row = sqlx::query(
        r#"
        SELECT user_id, consecutive_failure_count, suspended, last_failure_at, payment_suspended_at
        FROM cofund_payment_failures
        WHERE user_id = $1
        FOR UPDATE
        "#,
    )
    .bind(user_id)
    .fetch_one(&mut *conn)
    .await
    .map_err(query_err)?;
    failure_from_row(&row)
}

async fn write_failure_record(
    conn: &mut PgConnection,
    record: &PaymentFailureRecord,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        UPDATE cofund_payment_failures
        SET consecutive_failure_count = $2,
            suspended = $3,
            last_failure_at = $4,
            payment_suspended_at = $5
        WHERE user_id = $1
        "#,
    )
    .bind(&record.user_id)
    .bind(i32::try_from(record.consecutive_failure_count).unwrap_or(i32::MAX))
    .bind(record.suspended)
    .bind(record.last_failure_at)
    .bind(record.payment_suspended_at)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

async fn bump_failure(
    conn: &mut PgConnection,
    user_id: &str,
    threshold: u32,
    now: DateTime<Utc>,
    suspension_activity: &ActivityEntry,
) -> StorageResult<FailureUpdate> {
    let mut record = lock_failure_record(&mut *conn, user_id).await?;
    let newly_suspended = record.register_failure(threshold, now);
    write_failure_record(&mut *conn, &record).await?;
    if newly_suspended {
        insert_activity(&mut *conn, suspension_activity).await?;
    }
    Ok(FailureUpdate {
        record,
        newly_suspended,
    })
}

async fn reset_failure_count(conn: &mut PgConnection, user_id: &str) -> StorageResult<()> {
    sqlx::query(
        "UPDATE cofund_payment_failures SET consecutive_failure_count = 0 WHERE user_id = $1",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

async fn lock_account(conn: &mut PgConnection, user_id: &str) -> StorageResult<UserAccount> {
    let fresh = UserAccount::new(user_id);
    sqlx::query(
        r#"
        INSERT INTO cofund_accounts (user_id, banned, data, updated_at)
        VALUES ($1, FALSE, $2, $3)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(user_id)
    .bind(to_json(&fresh)?)
    .bind(fresh.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;

    let row = sqlx::query("SELECT data FROM cofund_accounts WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(query_err)?;
    data_of(&row)
}

async fn write_account(conn: &mut PgConnection, account: &UserAccount) -> StorageResult<()> {
    sqlx::query(
        "UPDATE cofund_accounts SET banned = $2, data = $3, updated_at = $4 WHERE user_id = $1",
    )
    .bind(&account.user_id)
    .bind(account.banned)
    .bind(to_json(account)?)
    .bind(account.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(query_err)?;
    Ok(())
}

impl Store for PostgresStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl ResourceStore for PostgresStore {
    async fn insert_resource(&self, resource: Resource) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cofund_resources (id, owner_id, active, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(resource.id)
        .bind(&resource.owner_id)
        .bind(resource.active)
        .bind(to_json(&resource)?)
        .bind(resource.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_or_query(e, || format!("resource {} already exists", resource.id)))?;
        Ok(())
    }

    async fn get_resource(&self, id: Uuid) -> StorageResult<Option<Resource>> {
        let row = sqlx::query("SELECT data FROM cofund_resources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.as_ref().map(data_of).transpose()
    }

    async fn list_active_resources(&self) -> StorageResult<Vec<Resource>> {
        let rows = sqlx::query(
            "SELECT data FROM cofund_resources WHERE active ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }
}

#[async_trait]
impl PledgeStore for PostgresStore {
    async fn insert_pending_pledge(&self, pledge: Pledge) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO cofund_pledges
                (id, owner_id, resource_id, status, intent_id, data, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(pledge.id)
        .bind(&pledge.owner_id)
        .bind(pledge.resource_id)
        .bind(pledge.status.as_str())
        .bind(&pledge.intent_id)
        .bind(to_json(&pledge)?)
        .bind(pledge.created_at)
        .bind(pledge.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            unique_or_query(e, || {
                format!(
                    "user {} already has an open pledge on resource {}",
                    pledge.owner_id, pledge.resource_id
                )
            })
        })?;
        Ok(())
    }

    async fn attach_intent(&self, pledge_id: Uuid, intent_id: &str) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut pledge = lock_pledge(&mut tx, pledge_id).await?;
        if pledge.status != PledgeStatus::Pending || pledge.intent_id.is_some() {
            return Err(StorageError::Conflict(format!(
                "pledge {pledge_id} cannot take intent {intent_id}"
            )));
        }
        pledge.intent_id = Some(intent_id.to_string());
        pledge.updated_at = Utc::now();
        write_pledge(&mut tx, &pledge).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn find_open_pledge(
        &self,
        owner_id: &str,
        resource_id: Uuid,
    ) -> StorageResult<Option<Pledge>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM cofund_pledges
            WHERE owner_id = $1 AND resource_id = $2 AND status <> 'withdrawn'
            "#,
        )
        .bind(owner_id)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(data_of).transpose()
    }

    async fn withdraw_pledge(
        &self,
        pledge_id: Uuid,
        only_if_pending: bool,
        now: DateTime<Utc>,
        activity: Option<ActivityEntry>,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut pledge = lock_pledge(&mut tx, pledge_id).await?;
        let allowed = match pledge.status {
            PledgeStatus::Withdrawn => false,
            PledgeStatus::Completed => !only_if_pending,
            PledgeStatus::Pending => true,
        };
        if !allowed {
            return Ok(false);
        }

        pledge.status = PledgeStatus::Withdrawn;
        pledge.updated_at = now;
        write_pledge(&mut tx, &pledge).await?;
        if let Some(entry) = &activity {
            insert_activity(&mut tx, entry).await?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn list_pledges(
        &self,
        resource_id: Uuid,
        status: PledgeStatus,
    ) -> StorageResult<Vec<Pledge>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM cofund_pledges
            WHERE resource_id = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(resource_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> StorageResult<Vec<Pledge>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM cofund_pledges
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }
}

#[async_trait]
impl BoostStore for PostgresStore {
    async fn count_live_boosts(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cofund_boosts WHERE active AND expires_at > $1")
                .bind(now)
                .fetch_one(&self.pool)
                .await
                .map_err(query_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn live_boost_for_resource(
        &self,
        resource_id: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Boost>> {
        let row = sqlx::query(
            r#"
            SELECT data FROM cofund_boosts
            WHERE resource_id = $1 AND active AND expires_at > $2
            LIMIT 1
            "#,
        )
        .bind(resource_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(data_of).transpose()
    }

    async fn list_live_boosts(&self, now: DateTime<Utc>) -> StorageResult<Vec<Boost>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM cofund_boosts
            WHERE active AND expires_at > $1
            ORDER BY expires_at ASC, id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }

    async fn list_expired_active(&self, now: DateTime<Utc>) -> StorageResult<Vec<Boost>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM cofund_boosts
            WHERE active AND expires_at <= $1
            ORDER BY expires_at ASC, id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }

    async fn expire_boost(&self, boost_id: Uuid, activity: ActivityEntry) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let flipped = sqlx::query(
            r#"
            UPDATE cofund_boosts
            SET active = FALSE, data = jsonb_set(data, '{active}', 'false'::jsonb)
            WHERE id = $1 AND active
            "#,
        )
        .bind(boost_id)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        if flipped == 0 {
            return Ok(false);
        }
        insert_activity(&mut tx, &activity).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }
}

#[async_trait]
impl FailureStore for PostgresStore {
    async fn get_failure_record(
        &self,
        user_id: &str,
    ) -> StorageResult<Option<PaymentFailureRecord>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, consecutive_failure_count, suspended, last_failure_at, payment_suspended_at
            FROM cofund_payment_failures
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;
        row.as_ref().map(failure_from_row).transpose()
    }

    async fn record_failure(
        &self,
        user_id: &str,
        threshold: u32,
        now: DateTime<Utc>,
        suspension_activity: ActivityEntry,
    ) -> StorageResult<FailureUpdate> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let update = bump_failure(&mut tx, user_id, threshold, now, &suspension_activity).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(update)
    }

    async fn record_success(&self, user_id: &str) -> StorageResult<()> {
        let mut conn = self.pool.acquire().await.map_err(query_err)?;
        reset_failure_count(&mut conn, user_id).await
    }

    async fn suspend(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut record = lock_failure_record(&mut tx, user_id).await?;
        if record.suspended {
            return Ok(false);
        }
        record.suspended = true;
        record.payment_suspended_at = Some(now);
        write_failure_record(&mut tx, &record).await?;
        insert_activity(&mut tx, &activity).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn unsuspend(
        &self,
        user_id: &str,
        activity: ActivityEntry,
    ) -> StorageResult<PaymentFailureRecord> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut record = lock_failure_record(&mut tx, user_id).await?;
        record.reset();
        write_failure_record(&mut tx, &record).await?;
        insert_activity(&mut tx, &activity).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(record)
    }
}

#[async_trait]
impl WithdrawalStore for PostgresStore {
    async fn insert_schedule_if_absent(
        &self,
        schedule: WithdrawalSchedule,
        activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO cofund_withdrawal_schedules (id, resource_id, cycle, status, due_at, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (resource_id, cycle) DO NOTHING
            "#,
        )
        .bind(schedule.id)
        .bind(schedule.resource_id)
        .bind(&schedule.cycle)
        .bind(schedule.status.as_str())
        .bind(schedule.due_at)
        .bind(to_json(&schedule)?)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        if inserted == 0 {
            return Ok(false);
        }
        insert_activity(&mut tx, &activity).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<WithdrawalSchedule>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM cofund_withdrawal_schedules
            WHERE status = 'scheduled' AND due_at <= $1
            ORDER BY due_at ASC, id ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }

    async fn list_schedules(&self, resource_id: Uuid) -> StorageResult<Vec<WithdrawalSchedule>> {
        let rows = sqlx::query(
            "SELECT data FROM cofund_withdrawal_schedules WHERE resource_id = $1 ORDER BY cycle ASC",
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }

    async fn mark_processed(
        &self,
        schedule_id: Uuid,
        transfer_reference: &str,
        processed_at: DateTime<Utc>,
        activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let row = sqlx::query(
            "SELECT data FROM cofund_withdrawal_schedules WHERE id = $1 FOR UPDATE",
        )
        .bind(schedule_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?
        .ok_or_else(|| StorageError::NotFound(format!("withdrawal schedule {schedule_id}")))?;
        let mut schedule: WithdrawalSchedule = data_of(&row)?;
        if schedule.status == WithdrawalStatus::Processed {
            return Ok(false);
        }

        schedule.status = WithdrawalStatus::Processed;
        schedule.processed_at = Some(processed_at);
        schedule.transfer_reference = Some(transfer_reference.to_string());
        sqlx::query("UPDATE cofund_withdrawal_schedules SET status = $2, data = $3 WHERE id = $1")
            .bind(schedule.id)
            .bind(schedule.status.as_str())
            .bind(to_json(&schedule)?)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        insert_activity(&mut tx, &activity).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }
}

#[async_trait]
impl ActivityStore for PostgresStore {
    async fn list_activity(&self, query: &ActivityQuery) -> StorageResult<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM cofund_activity
            WHERE ($1::TEXT IS NULL OR user_id = $1)
              AND ($2::UUID IS NULL OR resource_id = $2)
              AND ($3::TEXT IS NULL OR kind = $3)
            ORDER BY sequence DESC
            LIMIT $4
            "#,
        )
        .bind(query.user_id.as_deref())
        .bind(query.resource_id)
        .bind(query.kind.map(|kind| kind.as_str()))
        .bind(query.effective_limit() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(query_err)?;
        decode_rows(rows)
    }
}

#[async_trait]
impl SettlementStore for PostgresStore {
    async fn apply_settlement(&self, settlement: Settlement) -> StorageResult<SettlementApplied> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        // Concurrent deliveries of the same key block here until the first commits.
        let claimed = sqlx::query(
            r#"
            INSERT INTO cofund_processed_payments (idempotency_key, intent_id, event_id, recorded_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&settlement.idempotency_key)
        .bind(&settlement.intent_id)
        .bind(&settlement.event_id)
        .bind(settlement.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        if claimed == 0 {
            return Ok(SettlementApplied::Duplicate);
        }

        let applied = match &settlement.effect {
            SettlementEffect::CompletePledge {
                activities,
                rejection_activity,
            } => {
                reset_failure_count(&mut tx, &settlement.payer_id).await?;
                let row = sqlx::query(
                    r#"
                    SELECT data FROM cofund_pledges
                    WHERE intent_id = $1 AND status = 'pending'
                    FOR UPDATE
                    "#,
                )
                .bind(&settlement.intent_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?;

                match row {
                    Some(row) => {
                        let mut pledge: Pledge = data_of(&row)?;
                        let max_people = lock_capacity(&mut tx, pledge.resource_id).await?;
                        let completed: i64 = sqlx::query_scalar(
                            "SELECT COUNT(*) FROM cofund_pledges WHERE resource_id = $1 AND status = 'completed'",
                        )
                        .bind(pledge.resource_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(query_err)?;
                        let full = max_people
                            .is_some_and(|max| u64::try_from(completed).unwrap_or(u64::MAX) >= max);

                        pledge.updated_at = settlement.recorded_at;
                        if full {
                            pledge.status = PledgeStatus::Withdrawn;
                            write_pledge(&mut tx, &pledge).await?;
                            insert_activity(&mut tx, rejection_activity).await?;
                            SettlementApplied::PledgeRejected {
                                pledge,
                                max_people: max_people.unwrap_or_default(),
                            }
                        } else {
                            pledge.status = PledgeStatus::Completed;
                            write_pledge(&mut tx, &pledge).await?;
                            for entry in activities {
                                insert_activity(&mut tx, entry).await?;
                            }
                            SettlementApplied::PledgeCompleted(pledge)
                        }
                    }
                    None => SettlementApplied::PledgeMissing,
                }
            }
            SettlementEffect::ActivateBoost {
                boost,
                cap,
                activities,
                rejection_activity,
            } => {
                reset_failure_count(&mut tx, &settlement.payer_id).await?;
                sqlx::query("SELECT pg_advisory_xact_lock($1)")
                    .bind(BOOST_GUARD_LOCK)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_err)?;

                let now = settlement.recorded_at;
                let resource_taken: bool = sqlx::query_scalar(
                    r#"
                    SELECT EXISTS (
                        SELECT 1 FROM cofund_boosts
                        WHERE resource_id = $1 AND active AND expires_at > $2
                    )
                    "#,
                )
                .bind(boost.resource_id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;
                let live: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM cofund_boosts WHERE active AND expires_at > $1",
                )
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;

                let rejection = if resource_taken {
                    Some(BoostRejection::ResourceTaken)
                } else if usize::try_from(live).unwrap_or(usize::MAX) >= *cap {
                    Some(BoostRejection::CapReached { cap: *cap })
                } else {
                    None
                };
                if let Some(rejection) = rejection {
                    insert_activity(&mut tx, rejection_activity).await?;
                    SettlementApplied::BoostRejected(rejection)
                } else {
                    sqlx::query(
                        r#"
                        INSERT INTO cofund_boosts (id, resource_id, active, expires_at, data, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6)
                        "#,
                    )
                    .bind(boost.id)
                    .bind(boost.resource_id)
                    .bind(boost.active)
                    .bind(boost.expires_at)
                    .bind(to_json(boost)?)
                    .bind(boost.created_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(query_err)?;
                    for entry in activities {
                        insert_activity(&mut tx, entry).await?;
                    }
                    SettlementApplied::BoostActivated(boost.clone())
                }
            }
            SettlementEffect::RecordFailure {
                threshold,
                activity,
                suspension_activity,
            } => {
                insert_activity(&mut tx, activity).await?;
                let update = bump_failure(
                    &mut tx,
                    &settlement.payer_id,
                    *threshold,
                    settlement.recorded_at,
                    suspension_activity,
                )
                .await?;
                SettlementApplied::FailureRecorded(update)
            }
        };

        tx.commit().await.map_err(query_err)?;
        Ok(applied)
    }
}

#[async_trait]
impl AccountStore for PostgresStore {
    async fn get_account(&self, user_id: &str) -> StorageResult<Option<UserAccount>> {
        let row = sqlx::query("SELECT data FROM cofund_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;
        row.as_ref().map(data_of).transpose()
    }

    async fn set_payment_method(
        &self,
        user_id: &str,
        payment_method: &str,
    ) -> StorageResult<UserAccount> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut account = lock_account(&mut tx, user_id).await?;
        account.payment_method = Some(payment_method.to_string());
        account.updated_at = Utc::now();
        write_account(&mut tx, &account).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(account)
    }

    async fn ban_account(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        ban_activity: ActivityEntry,
        suspension_activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let mut account = lock_account(&mut tx, user_id).await?;
        if account.banned {
            return Ok(false);
        }
        account.banned = true;
        account.updated_at = now;
        write_account(&mut tx, &account).await?;
        insert_activity(&mut tx, &ban_activity).await?;

        let mut record = lock_failure_record(&mut tx, user_id).await?;
        if !record.suspended {
            record.suspended = true;
            record.payment_suspended_at = Some(now);
            write_failure_record(&mut tx, &record).await?;
            insert_activity(&mut tx, &suspension_activity).await?;
        }
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }

    async fn lift_ban(&self, user_id: &str, activity: ActivityEntry) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let row = sqlx::query("SELECT data FROM cofund_accounts WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        let Some(row) = row else {
            return Ok(false);
        };
        let mut account: UserAccount = data_of(&row)?;
        if !account.banned {
            return Ok(false);
        }
        account.banned = false;
        account.updated_at = Utc::now();
        write_account(&mut tx, &account).await?;
        insert_activity(&mut tx, &activity).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(true)
    }
}
