//! Durable throttle state — rules and fire logs over PostgreSQL.
//!
//! `throttle_rules` declares how often each canonical may fire;
//! `throttle_logs` records the last fire per identity tuple (canonical +
//! optional context). `try_fire` is the single place both are reconciled:
//! it locks the tuple's row, compares against the database clock, and
//! advances `last_fired_at` only when the window has elapsed. The unique
//! constraint on the identity tuple settles races between concurrent first
//! fires.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use klaxon_common::error::AppError;
use klaxon_common::types::{EntityRef, ThrottleLog, ThrottleRule};

const UNIQUE_VIOLATION: &str = "23505";
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Outcome of one `try_fire` transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAttempt {
    /// This caller owns the new window; `last_fired_at` now carries its fire time.
    Fired,
    /// An earlier fire's window is still open.
    WithinWindow,
    /// The tuple's row lock could not be acquired within the configured bound.
    LockTimeout,
}

/// Service layer for throttle rules and fire logs.
pub struct ThrottleStore;

impl ThrottleStore {
    /// Look up the rule for a canonical.
    pub async fn find_rule(pool: &PgPool, canonical: &str) -> Result<Option<ThrottleRule>, AppError> {
        let rule: Option<ThrottleRule> =
            sqlx::query_as("SELECT * FROM throttle_rules WHERE canonical = $1")
                .bind(canonical)
                .fetch_optional(pool)
                .await?;

        Ok(rule)
    }

    /// Create a rule with the given window unless one already exists.
    ///
    /// Concurrent creators race on the primary key; the loser re-reads the
    /// winner's row, so every caller gets the same rule back.
    pub async fn create_rule_if_absent(
        pool: &PgPool,
        canonical: &str,
        window_seconds: i64,
    ) -> Result<ThrottleRule, AppError> {
        let inserted: Option<ThrottleRule> = sqlx::query_as(
            r#"
            INSERT INTO throttle_rules (canonical, window_seconds)
            VALUES ($1, $2)
            ON CONFLICT (canonical) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(canonical)
        .bind(window_seconds)
        .fetch_optional(pool)
        .await?;

        if let Some(rule) = inserted {
            tracing::info!(
                canonical = %rule.canonical,
                window_seconds = rule.window_seconds,
                "Throttle rule auto-created"
            );
            return Ok(rule);
        }

        Self::find_rule(pool, canonical).await?.ok_or_else(|| {
            AppError::Internal(format!("Throttle rule '{}' missing after insert", canonical))
        })
    }

    /// Create or replace the rule for a canonical.
    pub async fn upsert_rule(
        pool: &PgPool,
        canonical: &str,
        window_seconds: i64,
        is_active: bool,
    ) -> Result<ThrottleRule, AppError> {
        let rule: ThrottleRule = sqlx::query_as(
            r#"
            INSERT INTO throttle_rules (canonical, window_seconds, is_active)
            VALUES ($1, $2, $3)
            ON CONFLICT (canonical) DO UPDATE
            SET window_seconds = EXCLUDED.window_seconds,
                is_active = EXCLUDED.is_active,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(canonical)
        .bind(window_seconds)
        .bind(is_active)
        .fetch_one(pool)
        .await?;

        tracing::info!(
            canonical = %rule.canonical,
            window_seconds = rule.window_seconds,
            is_active = rule.is_active,
            "Throttle rule upserted"
        );

        Ok(rule)
    }

    /// List all rules, stable order for the admin surface.
    pub async fn list_rules(pool: &PgPool) -> Result<Vec<ThrottleRule>, AppError> {
        let rules: Vec<ThrottleRule> =
            sqlx::query_as("SELECT * FROM throttle_rules ORDER BY canonical")
                .fetch_all(pool)
                .await?;

        Ok(rules)
    }

    /// Attempt to claim a fire for one identity tuple.
    ///
    /// Runs a single short transaction: bound lock waits, lock the tuple's
    /// row with `FOR UPDATE`, then insert (first fire), update (window
    /// elapsed) or leave untouched (window open). The elapsed comparison uses
    /// the database clock returned alongside the locked row, never the
    /// caller's clock.
    ///
    /// Callers must not pass `window_seconds <= 0`; zero windows are decided
    /// upstream without touching the log.
    pub async fn try_fire(
        pool: &PgPool,
        canonical: &str,
        context: Option<&EntityRef>,
        window_seconds: i64,
        lock_timeout_ms: u64,
    ) -> Result<FireAttempt, AppError> {
        let (context_type, context_id) = split_context(context);

        let mut tx = pool.begin().await?;

        // Transaction-scoped: competing decisions queue on the row lock for at
        // most this long before giving up with SQLSTATE 55P03.
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", lock_timeout_ms))
            .execute(&mut *tx)
            .await?;

        let locked: Result<Option<(DateTime<Utc>, DateTime<Utc>)>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT last_fired_at, now()
            FROM throttle_logs
            WHERE canonical = $1
              AND context_type IS NOT DISTINCT FROM $2
              AND context_id IS NOT DISTINCT FROM $3
            FOR UPDATE
            "#,
        )
        .bind(canonical)
        .bind(context_type)
        .bind(context_id)
        .fetch_optional(&mut *tx)
        .await;

        let row = match locked {
            Ok(row) => row,
            Err(e) if is_sqlstate(&e, LOCK_NOT_AVAILABLE) => {
                tx.rollback().await?;
                return Ok(FireAttempt::LockTimeout);
            }
            Err(e) => return Err(e.into()),
        };

        let attempt = match row {
            None => {
                // First fire for this tuple. A concurrent first fire races us
                // on the identity constraint; the loser's window is already
                // open, and a loser stuck behind the winner's uncommitted
                // insert is bounded by the same lock_timeout.
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO throttle_logs (canonical, context_type, context_id, last_fired_at)
                    VALUES ($1, $2, $3, now())
                    "#,
                )
                .bind(canonical)
                .bind(context_type)
                .bind(context_id)
                .execute(&mut *tx)
                .await;

                match inserted {
                    Ok(_) => FireAttempt::Fired,
                    Err(e) if is_sqlstate(&e, UNIQUE_VIOLATION) => {
                        tx.rollback().await?;
                        return Ok(FireAttempt::WithinWindow);
                    }
                    Err(e) if is_sqlstate(&e, LOCK_NOT_AVAILABLE) => {
                        tx.rollback().await?;
                        return Ok(FireAttempt::LockTimeout);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some((last_fired_at, db_now)) => {
                // Whole-second comparison, valid for any non-negative window
                if (db_now - last_fired_at).num_seconds() >= window_seconds {
                    sqlx::query(
                        r#"
                        UPDATE throttle_logs
                        SET last_fired_at = now()
                        WHERE canonical = $1
                          AND context_type IS NOT DISTINCT FROM $2
                          AND context_id IS NOT DISTINCT FROM $3
                        "#,
                    )
                    .bind(canonical)
                    .bind(context_type)
                    .bind(context_id)
                    .execute(&mut *tx)
                    .await?;

                    FireAttempt::Fired
                } else {
                    FireAttempt::WithinWindow
                }
            }
        };

        tx.commit().await?;
        Ok(attempt)
    }

    /// Fetch the fire log for one identity tuple.
    pub async fn find_log(
        pool: &PgPool,
        canonical: &str,
        context: Option<&EntityRef>,
    ) -> Result<Option<ThrottleLog>, AppError> {
        let (context_type, context_id) = split_context(context);

        let log: Option<ThrottleLog> = sqlx::query_as(
            r#"
            SELECT * FROM throttle_logs
            WHERE canonical = $1
              AND context_type IS NOT DISTINCT FROM $2
              AND context_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(canonical)
        .bind(context_type)
        .bind(context_id)
        .fetch_optional(pool)
        .await?;

        Ok(log)
    }

    /// Administrative reset for one identity tuple. Returns true if a log existed.
    pub async fn reset_log(
        pool: &PgPool,
        canonical: &str,
        context: Option<&EntityRef>,
    ) -> Result<bool, AppError> {
        let (context_type, context_id) = split_context(context);

        let result = sqlx::query(
            r#"
            DELETE FROM throttle_logs
            WHERE canonical = $1
              AND context_type IS NOT DISTINCT FROM $2
              AND context_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(canonical)
        .bind(context_type)
        .bind(context_id)
        .execute(pool)
        .await?;

        let deleted = result.rows_affected() > 0;
        if deleted {
            tracing::info!(canonical, "Throttle log reset");
        }

        Ok(deleted)
    }

    /// Administrative reset across every context of a canonical.
    pub async fn reset_logs(pool: &PgPool, canonical: &str) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM throttle_logs WHERE canonical = $1")
            .bind(canonical)
            .execute(pool)
            .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(canonical, deleted, "Throttle logs reset");
        }

        Ok(deleted)
    }
}

fn split_context(context: Option<&EntityRef>) -> (Option<&str>, Option<&str>) {
    match context {
        Some(entity) => (Some(entity.kind.as_str()), Some(entity.id.as_str())),
        None => (None, None),
    }
}

fn is_sqlstate(err: &sqlx::Error, code: &str) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(code))
}
