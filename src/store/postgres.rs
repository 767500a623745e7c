use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::{info, warn};

use super::{AttemptKey, EventFilter, SecurityStore};
use crate::config::StoreConfig;
use crate::error::{GuardError, GuardResult};
use crate::security::audit::{IpActivity, SecurityEvent, SecurityEventType};
use crate::security::csrf::CsrfToken;
use crate::security::rate_limiting::AttemptCounter;

const COUNTER_COLUMNS: &str =
    "identifier, action, ip_address, attempts_count, first_attempt_at, last_attempt_at, blocked_until";

const EVENT_COLUMNS: &str =
    "id, event_type, ip_address, user_agent, actor_id, details, severity, created_at";

/// PostgreSQL-backed store shared by every application instance
#[derive(Clone)]
pub struct PgSecurityStore {
    pool: PgPool,
}

impl PgSecurityStore {
    /// Open a connection pool
    pub async fn connect(config: &StoreConfig) -> GuardResult<Self> {
        let connection_string = config
            .database_url
            .as_deref()
            .ok_or_else(|| GuardError::config("store.database_url is required for the PostgreSQL store"))?;

        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(connection_string)
            .await?;

        info!("Database connection established");

        let store = Self { pool };
        if config.auto_migrate {
            store.migrate().await?;
        } else {
            warn!("Auto-migration is disabled. Run migrations manually with: guardctl migrate");
        }
        store.health_check().await?;

        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> GuardResult<()> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> GuardResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Gracefully close the database connection pool
    pub async fn close(self) {
        info!("Closing database connection pool...");
        self.pool.close().await;
        info!("Database connection pool closed");
    }
}

fn counter_from_row(row: &PgRow) -> GuardResult<AttemptCounter> {
    let attempts: i32 = row.try_get("attempts_count")?;
    Ok(AttemptCounter {
        ip_address: row.try_get("ip_address")?,
        identifier: row.try_get("identifier")?,
        action: row.try_get("action")?,
        attempts_count: u32::try_from(attempts)
            .map_err(|_| GuardError::storage(format!("negative attempts_count {}", attempts)))?,
        first_attempt_at: row.try_get("first_attempt_at")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        blocked_until: row.try_get("blocked_until")?,
    })
}

fn event_from_row(row: &PgRow) -> GuardResult<SecurityEvent> {
    let event_type: String = row.try_get("event_type")?;
    let severity: String = row.try_get("severity")?;
    Ok(SecurityEvent {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        event_type: event_type.parse()?,
        severity: severity.parse()?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        actor_id: row.try_get("actor_id")?,
        details: row.try_get("details")?,
    })
}

fn token_from_row(row: &PgRow) -> GuardResult<CsrfToken> {
    Ok(CsrfToken {
        form_name: row.try_get("form_name")?,
        token: row.try_get("token")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

fn push_event_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &EventFilter) {
    builder.push(" WHERE TRUE");
    if let Some(since) = filter.since {
        builder.push(" AND created_at >= ").push_bind(since);
    }
    if let Some(ip) = &filter.ip_address {
        builder.push(" AND ip_address = ").push_bind(ip.clone());
    }
    if let Some(event_type) = filter.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.as_str());
    }
    if let Some(severity) = filter.min_severity {
        builder.push(" AND severity_rank >= ").push_bind(severity.rank());
    }
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl SecurityStore for PgSecurityStore {
    async fn upsert_increment(
        &self,
        key: &AttemptKey,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> GuardResult<AttemptCounter> {
        let sql = format!(
            r#"
            INSERT INTO attempt_counters (identifier, action, ip_address, attempts_count, first_attempt_at, last_attempt_at)
            VALUES ($1, $2, $3, 1, $4, $4)
            ON CONFLICT (identifier, action) DO UPDATE
            SET attempts_count = attempt_counters.attempts_count + 1,
                last_attempt_at = EXCLUDED.last_attempt_at
            RETURNING {}
            "#,
            COUNTER_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(&key.identifier)
            .bind(&key.action)
            .bind(ip_address)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        counter_from_row(&row)
    }

    async fn get_counter(&self, key: &AttemptKey) -> GuardResult<Option<AttemptCounter>> {
        let sql = format!(
            "SELECT {} FROM attempt_counters WHERE identifier = $1 AND action = $2",
            COUNTER_COLUMNS
        );

        sqlx::query(&sql)
            .bind(&key.identifier)
            .bind(&key.action)
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(counter_from_row)
            .transpose()
    }

    async fn delete_counter(&self, key: &AttemptKey) -> GuardResult<()> {
        sqlx::query("DELETE FROM attempt_counters WHERE identifier = $1 AND action = $2")
            .bind(&key.identifier)
            .bind(&key.action)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_block(&self, key: &AttemptKey, until: DateTime<Utc>) -> GuardResult<()> {
        sqlx::query(
            "UPDATE attempt_counters SET blocked_until = $3 WHERE identifier = $1 AND action = $2",
        )
        .bind(&key.identifier)
        .bind(&key.action)
        .bind(until)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_stale_counters(
        &self,
        action: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GuardResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM attempt_counters
            WHERE action = $1
              AND first_attempt_at < $2
              AND (blocked_until IS NULL OR blocked_until <= $3)
            "#,
        )
        .bind(action)
        .bind(window_start)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_counters_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GuardResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM attempt_counters
            WHERE last_attempt_at < $1
              AND (blocked_until IS NULL OR blocked_until <= $2)
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_event(&self, event: &SecurityEvent) -> GuardResult<()> {
        sqlx::query(
            r#"
            INSERT INTO security_events (id, event_type, ip_address, user_agent, actor_id, details, severity, severity_rank, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.event_type.as_str())
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.actor_id)
        .bind(&event.details)
        .bind(event.severity.as_str())
        .bind(event.severity.rank())
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_events(&self, filter: &EventFilter) -> GuardResult<Vec<SecurityEvent>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM security_events", EVENT_COLUMNS));
        push_event_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn count_events(&self, filter: &EventFilter) -> GuardResult<u64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM security_events");
        push_event_filter(&mut builder, filter);

        let count: i64 = builder.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(to_count(count))
    }

    async fn count_events_by_type(
        &self,
        since: DateTime<Utc>,
    ) -> GuardResult<Vec<(SecurityEventType, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT event_type, COUNT(*) AS count
            FROM security_events
            WHERE created_at >= $1
            GROUP BY event_type
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = rows
            .iter()
            .map(|row| -> GuardResult<(SecurityEventType, u64)> {
                let event_type: String = row.try_get("event_type")?;
                let count: i64 = row.try_get("count")?;
                Ok((event_type.parse::<SecurityEventType>()?, to_count(count)))
            })
            .collect::<GuardResult<Vec<_>>>()?;
        counts.sort_by_key(|(event_type, _)| *event_type);
        Ok(counts)
    }

    async fn top_ips(&self, since: DateTime<Utc>, limit: usize) -> GuardResult<Vec<IpActivity>> {
        let rows = sqlx::query(
            r#"
            SELECT ip_address, COUNT(*) AS event_count
            FROM security_events
            WHERE created_at >= $1
            GROUP BY ip_address
            ORDER BY event_count DESC, ip_address ASC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> GuardResult<IpActivity> {
                let count: i64 = row.try_get("event_count")?;
                Ok(IpActivity {
                    ip_address: row.try_get("ip_address")?,
                    event_count: to_count(count),
                })
            })
            .collect()
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> GuardResult<u64> {
        let result = sqlx::query("DELETE FROM security_events WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn set_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
        token: &CsrfToken,
    ) -> GuardResult<()> {
        sqlx::query(
            r#"
            INSERT INTO csrf_tokens (session_id, form_name, token, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (session_id, form_name) DO UPDATE
            SET token = EXCLUDED.token,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(session_id)
        .bind(form_name)
        .bind(&token.token)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
    ) -> GuardResult<Option<CsrfToken>> {
        sqlx::query(
            r#"
            SELECT form_name, token, created_at, expires_at
            FROM csrf_tokens
            WHERE session_id = $1 AND form_name = $2
            "#,
        )
        .bind(session_id)
        .bind(form_name)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(token_from_row)
        .transpose()
    }

    async fn consume_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
        token: &str,
    ) -> GuardResult<bool> {
        let result = sqlx::query(
            "DELETE FROM csrf_tokens WHERE session_id = $1 AND form_name = $2 AND token = $3",
        )
        .bind(session_id)
        .bind(form_name)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge_expired_csrf_tokens(&self, now: DateTime<Utc>) -> GuardResult<u64> {
        let result = sqlx::query("DELETE FROM csrf_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
