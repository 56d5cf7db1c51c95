//! Concurrency drivers.
//!
//! These helpers run many transactions against one manager, either
//! interleaved on the current task or spread over spawned tasks.

use crate::generators::WriterPlan;
use arbordb_core::{CoreError, CoreResult, ExecutionContext, TransactionManager};
use arbordb_storage::{ObjectWrite, Oid, Tid};
use bytes::Bytes;
use futures::future::join_all;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Transactions attempted.
    pub total: usize,
    /// Transactions committed.
    pub committed: usize,
    /// Transactions rejected by conflict detection.
    pub conflicts: usize,
    /// Transactions that failed otherwise.
    pub failed: usize,
    /// Total duration.
    pub duration: Duration,
    /// Commits per second.
    pub commits_per_second: f64,
}

impl StressTestResult {
    fn tally(outcomes: &[CoreResult<Option<Tid>>], duration: Duration) -> Self {
        let committed = outcomes.iter().filter(|o| o.is_ok()).count();
        let conflicts = outcomes
            .iter()
            .filter(|o| matches!(o, Err(e) if e.is_conflict()))
            .count();
        let commits_per_second = if duration.as_secs_f64() > 0.0 {
            committed as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total: outcomes.len(),
            committed,
            conflicts,
            failed: outcomes.len() - committed - conflicts,
            duration,
            commits_per_second,
        }
    }

    /// Prints a summary of the run.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Transactions: {}", self.total);
        println!("Committed: {}", self.committed);
        println!("Conflicts: {}", self.conflicts);
        println!("Failed: {}", self.failed);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} commits/sec", self.commits_per_second);
    }
}

fn child(spec_name: &str, state: &[u8]) -> ObjectWrite {
    ObjectWrite::resource(
        Oid::new(),
        Oid::ROOT,
        spec_name,
        "Item",
        Bytes::copy_from_slice(state),
    )
}

/// Applies each writer's plan in its own transaction, one after another.
pub async fn apply_sequentially(
    manager: &TransactionManager,
    plan: &[WriterPlan],
) -> Vec<CoreResult<Option<Tid>>> {
    let mut outcomes = Vec::with_capacity(plan.len());
    for writes in plan {
        let ctx = ExecutionContext::new();
        let outcome = async {
            let txn = manager.begin(&ctx).await?;
            for spec in writes {
                txn.add(child(&spec.name, &spec.state))?;
            }
            manager.commit(&ctx).await
        }
        .await;
        if outcome.is_err() {
            manager.abort(&ctx).await;
        }
        outcomes.push(outcome);
    }
    outcomes
}

/// Begins every writer's transaction, stages all writes, then commits them
/// all at once so their lifetimes fully overlap.
///
/// The pool must hold at least one connection per writer.
pub async fn apply_interleaved(
    manager: &TransactionManager,
    plan: &[WriterPlan],
) -> CoreResult<Vec<CoreResult<Option<Tid>>>> {
    let contexts: Vec<ExecutionContext> = plan.iter().map(|_| ExecutionContext::new()).collect();

    for (ctx, writes) in contexts.iter().zip(plan) {
        let txn = manager.begin(ctx).await?;
        for spec in writes {
            txn.add(child(&spec.name, &spec.state))?;
        }
    }

    Ok(join_all(contexts.iter().map(|ctx| manager.commit(ctx))).await)
}

/// Runs `writers` spawned tasks, each committing `writes_per_writer` new
/// children of the root in one transaction.
pub async fn stress_disjoint_writers(
    manager: &TransactionManager,
    writers: usize,
    writes_per_writer: usize,
) -> Result<StressTestResult, CoreError> {
    let start = Instant::now();
    let tasks: Vec<_> = (0..writers)
        .map(|writer| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let ctx = ExecutionContext::new();
                let txn = manager.begin(&ctx).await?;
                for position in 0..writes_per_writer {
                    txn.add(child(&format!("s{writer}-{position}"), b"{}"))?;
                }
                manager.commit(&ctx).await
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(writers);
    for joined in join_all(tasks).await {
        outcomes.push(joined.map_err(|e| CoreError::internal(format!("writer task failed: {e}")))?);
    }
    Ok(StressTestResult::tally(&outcomes, start.elapsed()))
}

/// Runs `writers` spawned tasks that all rewrite `target`, each retrying
/// on conflict as configured on the manager.
pub async fn stress_contended_object(
    manager: &TransactionManager,
    target: Oid,
    writers: usize,
) -> Result<StressTestResult, CoreError> {
    let start = Instant::now();
    let tasks: Vec<_> = (0..writers)
        .map(|writer| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let ctx = ExecutionContext::new();
                manager
                    .run(&ctx, |txn| async move {
                        let record = txn.get(target).await?;
                        let write = record.to_write().with_state(format!("writer-{writer}"));
                        txn.update(write).await?;
                        tokio::task::yield_now().await;
                        Ok(())
                    })
                    .await
                    .map(|()| None::<Tid>)
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(writers);
    for joined in join_all(tasks).await {
        outcomes.push(joined.map_err(|e| CoreError::internal(format!("writer task failed: {e}")))?);
    }
    Ok(StressTestResult::tally(&outcomes, start.elapsed()))
}
