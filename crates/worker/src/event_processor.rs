//! Billing Event Inbox Processor
//!
//! Drains subscription events from the persistent inbox and hands each one to
//! the entitlement synchronizer exactly once per attempt. The synchronizer
//! never retries; this loop owns backoff and dead-lettering.

use sqlx::PgPool;
use storefront_billing::{BillingError, EntitlementSynchronizer, ErrorKind, SubscriptionEvent};
use storefront_shared::OrgId;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A claimed inbox row
#[derive(Debug, sqlx::FromRow)]
struct InboxEvent {
    id: Uuid,
    org_id: Uuid,
    external_event_id: String,
    payload: serde_json::Value,
    /// Already includes the current attempt
    attempts: i32,
    max_attempts: i32,
    created_at: OffsetDateTime,
}

/// What to do with an event whose sync failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Leave as `failed` so a later poll claims it again
    Retry,
    /// Park for manual reconciliation
    DeadLetter,
}

impl Disposition {
    fn status(self) -> &'static str {
        match self {
            Disposition::Retry => "failed",
            Disposition::DeadLetter => "dead_letter",
        }
    }
}

/// Decide between retry and dead-letter for a failed sync.
///
/// `NotFound` is retried: the organization row can lag behind the first
/// subscription event for a new signup.
pub fn disposition(err: &BillingError, attempts: i32, max_attempts: i32) -> Disposition {
    match err.kind() {
        ErrorKind::Transient | ErrorKind::NotFound if attempts < max_attempts => {
            Disposition::Retry
        }
        _ => Disposition::DeadLetter,
    }
}

/// Counters for one drain pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InboxRunStats {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Claim and process one batch of inbox events
pub async fn process_billing_inbox(
    pool: &PgPool,
    sync: &EntitlementSynchronizer,
    batch_size: i64,
    retry_delay_secs: i64,
) -> InboxRunStats {
    let mut stats = InboxRunStats {
        dead_lettered: dead_letter_abandoned(pool, retry_delay_secs).await,
        ..InboxRunStats::default()
    };

    let mut events = match claim_batch(pool, batch_size, retry_delay_secs).await {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to claim billing events from inbox");
            return stats;
        }
    };

    if events.is_empty() {
        return stats;
    }

    // RETURNING gives no ordering guarantee
    events.sort_by_key(|event| event.created_at);
    stats.claimed = events.len();
    info!(count = events.len(), "Processing billing events from inbox");

    for event in events {
        let result = match serde_json::from_value::<SubscriptionEvent>(event.payload.clone()) {
            Ok(payload) => sync
                .sync_subscription_status(OrgId(event.org_id), &payload)
                .await
                .map(|_| ()),
            Err(e) => Err(BillingError::InvalidEvent(format!(
                "undecodable inbox payload: {}",
                e
            ))),
        };

        match result {
            Ok(()) => {
                mark_completed(pool, event.id).await;
                stats.completed += 1;
                info!(
                    inbox_id = %event.id,
                    org_id = %event.org_id,
                    event_id = %event.external_event_id,
                    "Billing event processed"
                );
            }
            Err(err) => {
                let outcome = disposition(&err, event.attempts, event.max_attempts);
                mark_failed(pool, event.id, outcome, &err.to_string()).await;

                match outcome {
                    Disposition::Retry => {
                        stats.retried += 1;
                        warn!(
                            inbox_id = %event.id,
                            org_id = %event.org_id,
                            event_id = %event.external_event_id,
                            attempts = event.attempts,
                            max_attempts = event.max_attempts,
                            error = %err,
                            "Billing event failed, will retry"
                        );
                    }
                    Disposition::DeadLetter => {
                        stats.dead_lettered += 1;
                        error!(
                            inbox_id = %event.id,
                            org_id = %event.org_id,
                            event_id = %event.external_event_id,
                            attempts = event.attempts,
                            error = %err,
                            "Billing event dead-lettered, needs manual reconciliation"
                        );
                    }
                }
            }
        }
    }

    stats
}

/// Dead-letter rows a worker abandoned mid-processing on their final attempt.
/// The claim query never picks these up again.
async fn dead_letter_abandoned(pool: &PgPool, retry_delay_secs: i64) -> usize {
    let abandoned: Vec<(Uuid, Uuid, String, i32)> = match sqlx::query_as(
        r#"
        UPDATE billing_event_inbox
        SET status = 'dead_letter',
            last_error = COALESCE(last_error, 'abandoned while processing on final attempt')
        WHERE status = 'processing'
          AND attempts >= max_attempts
          AND last_attempt_at < NOW() - make_interval(secs => $1)
        RETURNING id, org_id, external_event_id, attempts
        "#,
    )
    .bind(retry_delay_secs as f64)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to sweep abandoned billing events");
            return 0;
        }
    };

    for (inbox_id, org_id, event_id, attempts) in &abandoned {
        error!(
            inbox_id = %inbox_id,
            org_id = %org_id,
            event_id = %event_id,
            attempts = attempts,
            "Billing event abandoned on final attempt, dead-lettered for manual reconciliation"
        );
    }

    abandoned.len()
}

/// Claim pending events plus failed or abandoned ones past the retry delay.
///
/// Claiming and marking `processing` happen in one statement so two workers
/// never pick up the same row.
async fn claim_batch(
    pool: &PgPool,
    batch_size: i64,
    retry_delay_secs: i64,
) -> Result<Vec<InboxEvent>, sqlx::Error> {
    sqlx::query_as::<_, InboxEvent>(
        r#"
        UPDATE billing_event_inbox
        SET status = 'processing', attempts = attempts + 1, last_attempt_at = NOW()
        WHERE id IN (
            SELECT id
            FROM billing_event_inbox
            WHERE status = 'pending'
               OR (status IN ('failed', 'processing')
                   AND attempts < max_attempts
                   AND last_attempt_at < NOW() - make_interval(secs => $2))
            ORDER BY created_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, org_id, external_event_id, payload, attempts, max_attempts, created_at
        "#,
    )
    .bind(batch_size)
    .bind(retry_delay_secs as f64)
    .fetch_all(pool)
    .await
}

async fn mark_completed(pool: &PgPool, inbox_id: Uuid) {
    if let Err(e) = sqlx::query(
        "UPDATE billing_event_inbox SET status = 'completed', last_error = NULL, processed_at = NOW() WHERE id = $1",
    )
    .bind(inbox_id)
    .execute(pool)
    .await
    {
        error!(inbox_id = %inbox_id, error = %e, "Failed to mark billing event as completed");
    }
}

async fn mark_failed(pool: &PgPool, inbox_id: Uuid, outcome: Disposition, message: &str) {
    if let Err(e) = sqlx::query(
        "UPDATE billing_event_inbox SET status = $1, last_error = $2 WHERE id = $3",
    )
    .bind(outcome.status())
    .bind(message)
    .bind(inbox_id)
    .execute(pool)
    .await
    {
        error!(inbox_id = %inbox_id, error = %e, "Failed to record billing event failure");
    }
}

/// Delete completed inbox rows older than the retention window.
/// Dead letters are kept until someone resolves them.
pub async fn cleanup_completed_events(pool: &PgPool, retention_days: i32) {
    let result = sqlx::query(
        r#"
        DELETE FROM billing_event_inbox
        WHERE status = 'completed'
          AND processed_at < NOW() - make_interval(days => $1)
        "#,
    )
    .bind(retention_days)
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days = retention_days,
                    "Cleaned up completed billing events"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to clean up billing event inbox");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_retry_until_max() {
        let err = BillingError::Database("connection reset".into());
        assert_eq!(disposition(&err, 1, 8), Disposition::Retry);
        assert_eq!(disposition(&err, 7, 8), Disposition::Retry);
        assert_eq!(disposition(&err, 8, 8), Disposition::DeadLetter);
    }

    #[test]
    fn test_unknown_org_retries() {
        let err = BillingError::NotFound("organization".into());
        assert_eq!(disposition(&err, 2, 8), Disposition::Retry);
        assert_eq!(disposition(&err, 8, 8), Disposition::DeadLetter);
    }

    #[test]
    fn test_config_and_malformed_dead_letter_immediately() {
        let errors = [
            BillingError::UnknownPlan("TEAM".into()),
            BillingError::MissingPlanMetadata {
                event_id: "evt_1".into(),
            },
            BillingError::InvalidEvent("bad interval".into()),
            BillingError::Internal("corrupt row".into()),
        ];
        for err in &errors {
            assert_eq!(disposition(err, 1, 8), Disposition::DeadLetter);
        }
    }

    async fn test_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = storefront_shared::create_pool(&url, 2)
            .await
            .expect("Failed to create pool");
        storefront_shared::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        pool
    }

    async fn insert_inbox_row(pool: &PgPool, status: &str, attempts: i32) -> Uuid {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_event_inbox
                (org_id, external_event_id, payload, status, attempts, max_attempts, last_attempt_at)
            VALUES ($1, $2, '{}'::jsonb, $3, $4, 8, NOW() - INTERVAL '1 hour')
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(format!("evt_{}", Uuid::new_v4().simple()))
        .bind(status)
        .bind(attempts)
        .fetch_one(pool)
        .await
        .unwrap();
        id
    }

    async fn inbox_status(pool: &PgPool, id: Uuid) -> String {
        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM billing_event_inbox WHERE id = $1")
                .bind(id)
                .fetch_one(pool)
                .await
                .unwrap();
        status
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_abandoned_final_attempt_is_dead_lettered() {
        let pool = test_pool().await;
        let exhausted = insert_inbox_row(&pool, "processing", 8).await;
        let retryable = insert_inbox_row(&pool, "processing", 3).await;

        let swept = dead_letter_abandoned(&pool, 300).await;

        assert!(swept >= 1);
        assert_eq!(inbox_status(&pool, exhausted).await, "dead_letter");
        assert_eq!(inbox_status(&pool, retryable).await, "processing");
    }

    #[test]
    fn test_disposition_status_strings() {
        assert_eq!(Disposition::Retry.status(), "failed");
        assert_eq!(Disposition::DeadLetter.status(), "dead_letter");
    }
}
