//! Queue worker: claims log-processing jobs and runs the pipeline.
//!
//! A pool of worker loops processes jobs in parallel; each job handles one
//! run end-to-end, so parallelism is across runs, never within one. A
//! background sweep returns stalled jobs (expired lock leases) to the
//! queue every `queue.sweep_interval_secs`.
//!
//! Shutdown is graceful: on ctrl-c each loop finishes its current job and
//! exits; a job claimed but interrupted before completion is recovered by
//! the stall sweep of a later worker.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::Config;
use crate::fetcher::{self, FetchError};
use crate::models::{Repository, RunStatus};
use crate::pipeline;
use crate::queue::{self, Job, LogProcessingJob, LOG_PROCESSING};
use crate::store;

/// Poll interval when the queue is empty.
const IDLE_POLL_SECS: u64 = 1;

/// Run the worker pool until ctrl-c.
pub async fn run_worker(pool: SqlitePool, config: Config, concurrency: usize) -> Result<()> {
    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    println!(
        "worker: {} executor(s) on queue '{}', lock {}s, sweep every {}s",
        concurrency.max(1),
        LOG_PROCESSING,
        config.queue.lock_secs,
        config.queue.sweep_interval_secs
    );

    let sweeper = tokio::spawn(sweep_loop(
        pool.clone(),
        config.clone(),
        shutdown_rx.clone(),
    ));

    let mut workers = Vec::new();
    for n in 0..concurrency.max(1) {
        workers.push(tokio::spawn(worker_loop(
            n,
            pool.clone(),
            config.clone(),
            shutdown_rx.clone(),
        )));
    }

    for handle in workers {
        let _ = handle.await;
    }
    let _ = sweeper.await;

    println!("worker: shut down");
    Ok(())
}

async fn sweep_loop(pool: SqlitePool, config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.queue.sweep_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = chrono::Utc::now().timestamp();
                match queue::sweep_stalled(
                    &pool,
                    LOG_PROCESSING,
                    config.queue.max_stalled_retries,
                    now,
                )
                .await
                {
                    Ok(0) => {}
                    Ok(n) => println!("worker: recovered {} stalled job(s)", n),
                    Err(e) => eprintln!("Warning: stall sweep failed: {}", e),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

async fn worker_loop(
    n: usize,
    pool: SqlitePool,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let now = chrono::Utc::now().timestamp();
        let claimed = match queue::claim_next(&pool, LOG_PROCESSING, config.queue.lock_secs, now)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                eprintln!("Warning: worker {}: claim failed: {}", n, e);
                None
            }
        };

        match claimed {
            Some(job) => {
                // The claimed job runs to completion even if shutdown
                // arrives meanwhile; the loop exits on the next pass.
                if let Err(e) = handle_job(&pool, &config, &job).await {
                    eprintln!("Warning: worker {}: job bookkeeping failed: {}", n, e);
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(IDLE_POLL_SECS)) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

/// Process one claimed job end-to-end and record its outcome.
///
/// Only queue bookkeeping errors propagate; pipeline failures are recorded
/// on the job row with retry semantics decided by [`is_retryable`].
pub async fn handle_job(pool: &SqlitePool, config: &Config, job: &Job) -> Result<()> {
    let payload: LogProcessingJob = match serde_json::from_str(&job.payload) {
        Ok(p) => p,
        Err(e) => {
            return record_failure(pool, config, job, &format!("bad payload: {}", e), true).await;
        }
    };

    println!(
        "worker: processing run {} ({}), attempt {}",
        payload.run_id, payload.repo_full_name, job.attempts
    );

    let run_row_id =
        match ensure_run(pool, &payload.repo_full_name, payload.run_id).await {
            Ok(id) => id,
            Err(e) => return record_failure(pool, config, job, &e.to_string(), false).await,
        };

    let raw = match fetcher::fetch_run_log(&config.provider, &payload.repo_full_name, payload.run_id)
        .await
    {
        Ok(raw) => raw,
        Err(e) => {
            return record_failure(pool, config, job, &e.to_string(), !e.is_retryable()).await;
        }
    };

    match pipeline::process_run(pool, config, &run_row_id, &raw).await {
        Ok(result) => {
            println!(
                "worker: run {} classified {} (priority {}), used_llm={}",
                payload.run_id, result.failure_type, result.priority, result.used_llm
            );
            queue::complete(pool, &job.id, chrono::Utc::now().timestamp()).await
        }
        Err(e) => record_failure(pool, config, job, &e.to_string(), !is_retryable(&e)).await,
    }
}

async fn record_failure(
    pool: &SqlitePool,
    config: &Config,
    job: &Job,
    error: &str,
    terminal: bool,
) -> Result<()> {
    eprintln!(
        "Warning: job {} {} failed: {}",
        job.id,
        if terminal { "terminally" } else { "(will retry)" },
        error
    );
    queue::fail(
        pool,
        job,
        error,
        terminal,
        config.queue.max_stalled_retries,
        config.queue.backoff_initial_ms,
        chrono::Utc::now().timestamp(),
    )
    .await
}

/// Retryable: transient transport and pool-level database errors.
/// Terminal: everything typed as unrecoverable (bad archives, empty logs,
/// constraint violations, parse failures).
fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(fetch) = err.downcast_ref::<FetchError>() {
        return fetch.is_retryable();
    }
    if let Some(db) = err.downcast_ref::<sqlx::Error>() {
        // Constraint violations are operator errors; connection-level
        // failures deserve another attempt.
        return !matches!(db, sqlx::Error::Database(_));
    }
    false
}

/// Make sure a run row exists for the job, creating the repository and a
/// minimal run when the originating webhook was never stored.
async fn ensure_run(pool: &SqlitePool, repo_full_name: &str, provider_run_id: i64) -> Result<String> {
    if let Some(run) = store::get_run_by_provider_id(pool, provider_run_id).await? {
        return Ok(run.id);
    }

    let (owner, name) = repo_full_name
        .split_once('/')
        .ok_or_else(|| anyhow::anyhow!("malformed repo name: {}", repo_full_name))?;

    let repo = Repository {
        id: Uuid::new_v4().to_string(),
        provider_id: synthetic_provider_id(repo_full_name),
        owner: owner.to_string(),
        name: name.to_string(),
        private: false,
        user_id: None,
    };
    let repo_id = store::upsert_repository(pool, &repo).await?;

    let run = store::new_run(
        provider_run_id,
        &repo_id,
        "(unknown workflow)",
        RunStatus::Failure,
        chrono::Utc::now().timestamp(),
    );
    store::upsert_run(pool, &run).await
}

/// Stable stand-in provider id derived from the repository name, used only
/// when a job arrives for a repository that was never imported.
fn synthetic_provider_id(full_name: &str) -> i64 {
    let digest = Sha256::digest(full_name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (i64::from_le_bytes(bytes) & i64::MAX).max(1)
}
