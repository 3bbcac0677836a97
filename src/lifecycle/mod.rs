//! Entity lifecycle state machines.
//!
//! Each `apply_*_delta` validates and applies one entity's transition inside
//! a single transaction, consulting the administrator-preservation guard
//! where a transition could strip coverage. Batch routes fan ids out through
//! [`run_batch`], one task per id, so a failing id never aborts its
//! siblings.

pub mod membership;
pub mod organization;
pub mod package;
pub mod user;

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::AppError;

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchFailure {
    pub id: Uuid,
    /// Machine-readable error kind (`AppError::kind`).
    pub error: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome<T> {
    pub applied: Vec<T>,
    pub failed: Vec<BatchFailure>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            applied: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn record(&mut self, id: Uuid, result: Result<T, AppError>) {
        match result {
            Ok(snapshot) => self.applied.push(snapshot),
            Err(err) => self.failed.push(BatchFailure {
                id,
                error: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Runs one mutation per id concurrently and collects per-id outcomes.
///
/// Each factory must produce an independent transaction for its id. SQLite
/// write-lock contention between sibling transactions surfaces as a "database
/// is locked" error; deltas are declarative and safe to re-apply, so those
/// attempts are retried a bounded number of times before being reported.
pub async fn run_batch<T, F, Fut>(items: Vec<(Uuid, F)>) -> BatchOutcome<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, AppError>> + Send,
{
    let mut tasks = JoinSet::new();

    for (id, factory) in items {
        tasks.spawn(async move {
            let mut result = factory().await;

            for backoff_ms in [20u64, 50, 120] {
                if !is_lock_contention(&result) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                result = factory().await;
            }

            (id, result)
        });
    }

    collect(tasks).await
}

fn is_lock_contention<T>(result: &Result<T, AppError>) -> bool {
    match result {
        Err(AppError::Database(err)) => err
            .as_database_error()
            .map(|db| db.message().contains("locked"))
            .unwrap_or(false),
        _ => false,
    }
}

async fn collect<T: Send + 'static>(
    mut tasks: JoinSet<(Uuid, Result<T, AppError>)>,
) -> BatchOutcome<T> {
    let mut outcome = BatchOutcome::default();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, result)) => outcome.record(id, result),
            Err(err) => tracing::error!(error = %err, "batch mutation task failed to join"),
        }
    }

    outcome
}
