//! At-least-once job queue over the SQLite store.
//!
//! Jobs are claimed with a lock lease (`locked_until`): a claim marks the
//! row `running` and gives the worker `lock_secs` to finish. Workers that
//! die mid-job leave an expired lease behind; the stall sweep returns such
//! jobs to `pending` until the retry budget is spent. Retryable failures
//! reschedule with exponential backoff from `backoff_initial_ms`.
//!
//! Completed and failed rows are retained for inspection; nothing here
//! deduplicates — the pipeline itself is idempotent, so duplicate delivery
//! of the same run is harmless.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Queue and job name for log-processing work.
pub const LOG_PROCESSING: &str = "log-processing";

/// Payload of a log-processing job, as delivered over the queue protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogProcessingJob {
    pub repo_full_name: String,
    pub run_id: i64,
    pub installation_id: i64,
}

/// A claimed queue row.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub payload: String,
    pub attempts: i64,
}

/// Enqueue a payload; returns the job id.
pub async fn enqueue(
    pool: &SqlitePool,
    queue: &str,
    name: &str,
    payload: &str,
    now: i64,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO jobs (id, queue, name, payload, status, attempts, locked_until,
                          run_after, last_error, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'pending', 0, NULL, ?, NULL, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(queue)
    .bind(name)
    .bind(payload)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

/// Claim the oldest runnable job, if any.
///
/// The claim is optimistic: the row is selected and then updated only if
/// it is still pending, so concurrent workers never double-claim.
pub async fn claim_next(
    pool: &SqlitePool,
    queue: &str,
    lock_secs: i64,
    now: i64,
) -> Result<Option<Job>> {
    loop {
        let row = sqlx::query(
            r#"
            SELECT id, queue, name, payload, attempts
            FROM jobs
            WHERE queue = ? AND status = 'pending' AND run_after <= ?
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.get("id");

        let claimed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1,
                locked_until = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now + lock_secs)
        .bind(now)
        .bind(&id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            return Ok(Some(Job {
                id,
                queue: row.get("queue"),
                name: row.get("name"),
                payload: row.get("payload"),
                attempts: row.get::<i64, _>("attempts") + 1,
            }));
        }
        // Lost the race; try the next pending row.
    }
}

/// Mark a job done. The row is retained as history.
pub async fn complete(pool: &SqlitePool, job_id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'completed', locked_until = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Record a failure.
///
/// Terminal failures (and exhausted retry budgets) park the job as
/// `failed` for operator inspection. Retryable failures return it to
/// `pending` with exponential backoff: `backoff_initial_ms × 2^(attempt−1)`.
#[allow(clippy::too_many_arguments)]
pub async fn fail(
    pool: &SqlitePool,
    job: &Job,
    error: &str,
    terminal: bool,
    max_retries: i64,
    backoff_initial_ms: i64,
    now: i64,
) -> Result<()> {
    let out_of_budget = job.attempts > max_retries;

    if terminal || out_of_budget {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', locked_until = NULL, last_error = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(now)
        .bind(&job.id)
        .execute(pool)
        .await?;
        return Ok(());
    }

    let backoff_ms = backoff_initial_ms.saturating_mul(1i64 << (job.attempts - 1).clamp(0, 16));
    let run_after = now + (backoff_ms + 999) / 1000;

    sqlx::query(
        "UPDATE jobs SET status = 'pending', locked_until = NULL, last_error = ?, \
         run_after = ?, updated_at = ? WHERE id = ?",
    )
    .bind(error)
    .bind(run_after)
    .bind(now)
    .bind(&job.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Return a running job to the queue without penalty (graceful shutdown).
pub async fn release(pool: &SqlitePool, job_id: &str, now: i64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET status = 'pending', locked_until = NULL, run_after = ?, \
         updated_at = ? WHERE id = ? AND status = 'running'",
    )
    .bind(now)
    .bind(now)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Recover jobs whose lock lease expired. Within the retry budget the job
/// goes back to `pending`; past it, it is failed as stalled. Returns how
/// many rows were touched.
pub async fn sweep_stalled(
    pool: &SqlitePool,
    queue: &str,
    max_stalled_retries: i64,
    now: i64,
) -> Result<u64> {
    let recovered = sqlx::query(
        r#"
        UPDATE jobs SET status = 'pending', locked_until = NULL, run_after = ?,
                        last_error = 'stalled: lock expired', updated_at = ?
        WHERE queue = ? AND status = 'running' AND locked_until < ? AND attempts <= ?
        "#,
    )
    .bind(now)
    .bind(now)
    .bind(queue)
    .bind(now)
    .bind(max_stalled_retries)
    .execute(pool)
    .await?;

    let exhausted = sqlx::query(
        r#"
        UPDATE jobs SET status = 'failed', locked_until = NULL,
                        last_error = 'stalled: retry budget exhausted', updated_at = ?
        WHERE queue = ? AND status = 'running' AND locked_until < ? AND attempts > ?
        "#,
    )
    .bind(now)
    .bind(queue)
    .bind(now)
    .bind(max_stalled_retries)
    .execute(pool)
    .await?;

    Ok(recovered.rows_affected() + exhausted.rows_affected())
}

/// Job counts by status, for the stats surface.
pub async fn counts(pool: &SqlitePool, queue: &str) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT status, COUNT(*) AS n FROM jobs WHERE queue = ? GROUP BY status ORDER BY status",
    )
    .bind(queue)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use crate::migrate::run_migrations;

    async fn setup() -> SqlitePool {
        let pool = connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn payload(run_id: i64) -> String {
        serde_json::to_string(&LogProcessingJob {
            repo_full_name: "acme/widgets".to_string(),
            run_id,
            installation_id: 7,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_claim_complete() {
        let pool = setup().await;
        let now = 1_000;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), now)
            .await
            .unwrap();

        let job = claim_next(&pool, LOG_PROCESSING, 600, now)
            .await
            .unwrap()
            .expect("job available");
        assert_eq!(job.attempts, 1);

        let parsed: LogProcessingJob = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(parsed.repo_full_name, "acme/widgets");
        assert_eq!(parsed.run_id, 1);

        // Claimed job is locked; nothing else to claim.
        assert!(claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().is_none());

        complete(&pool, &job.id, now + 5).await.unwrap();
        let by_status = counts(&pool, LOG_PROCESSING).await.unwrap();
        assert_eq!(by_status, vec![("completed".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let pool = setup().await;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), 100).await.unwrap();
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(2), 200).await.unwrap();

        let job = claim_next(&pool, LOG_PROCESSING, 600, 300).await.unwrap().unwrap();
        let parsed: LogProcessingJob = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(parsed.run_id, 1);
    }

    #[tokio::test]
    async fn test_retry_backoff_schedule() {
        let pool = setup().await;
        let now = 10_000;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), now).await.unwrap();

        // First attempt fails: backoff 2s.
        let job = claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().unwrap();
        fail(&pool, &job, "connect timeout", false, 3, 2000, now).await.unwrap();

        assert!(claim_next(&pool, LOG_PROCESSING, 600, now + 1).await.unwrap().is_none());
        let job = claim_next(&pool, LOG_PROCESSING, 600, now + 2)
            .await
            .unwrap()
            .expect("runnable after 2s backoff");
        assert_eq!(job.attempts, 2);

        // Second attempt fails: backoff 4s.
        fail(&pool, &job, "connect timeout", false, 3, 2000, now + 2).await.unwrap();
        assert!(claim_next(&pool, LOG_PROCESSING, 600, now + 5).await.unwrap().is_none());
        assert!(claim_next(&pool, LOG_PROCESSING, 600, now + 6).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminal_failure_parks_job() {
        let pool = setup().await;
        let now = 50;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), now).await.unwrap();
        let job = claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().unwrap();

        fail(&pool, &job, "empty log", true, 3, 2000, now).await.unwrap();

        assert!(claim_next(&pool, LOG_PROCESSING, 600, now + 10_000).await.unwrap().is_none());
        let last_error: Option<String> =
            sqlx::query_scalar("SELECT last_error FROM jobs WHERE id = ?")
                .bind(&job.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(last_error.as_deref(), Some("empty log"));
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion() {
        let pool = setup().await;
        let mut now = 100;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), now).await.unwrap();

        // max_retries = 3 allows attempts 1..=3 to reschedule; attempt 4 fails hard.
        for _ in 0..3 {
            now += 100_000;
            let job = claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().unwrap();
            fail(&pool, &job, "transient", false, 3, 2000, now).await.unwrap();
        }
        now += 100_000;
        let job = claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().unwrap();
        assert_eq!(job.attempts, 4);
        fail(&pool, &job, "transient", false, 3, 2000, now).await.unwrap();

        let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(&job.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn test_sweep_recovers_stalled_jobs() {
        let pool = setup().await;
        let now = 1_000;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), now).await.unwrap();
        let job = claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().unwrap();

        // Before the lease expires the sweep is a no-op.
        assert_eq!(sweep_stalled(&pool, LOG_PROCESSING, 3, now + 100).await.unwrap(), 0);

        // After expiry the job returns to pending and can be reclaimed.
        assert_eq!(sweep_stalled(&pool, LOG_PROCESSING, 3, now + 601).await.unwrap(), 1);
        let again = claim_next(&pool, LOG_PROCESSING, 600, now + 601).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_sweep_fails_exhausted_jobs() {
        let pool = setup().await;
        let mut now = 1_000;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), now).await.unwrap();

        // Stall out four attempts with max_stalled_retries = 3.
        for _ in 0..4 {
            claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().unwrap();
            now += 601;
            sweep_stalled(&pool, LOG_PROCESSING, 3, now).await.unwrap();
        }

        let status: String = sqlx::query_scalar("SELECT status FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[tokio::test]
    async fn test_release_returns_job_without_penalty() {
        let pool = setup().await;
        let now = 1_000;
        enqueue(&pool, LOG_PROCESSING, LOG_PROCESSING, &payload(1), now).await.unwrap();
        let job = claim_next(&pool, LOG_PROCESSING, 600, now).await.unwrap().unwrap();

        release(&pool, &job.id, now + 1).await.unwrap();

        let again = claim_next(&pool, LOG_PROCESSING, 600, now + 1).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 2);
    }
}
