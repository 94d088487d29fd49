use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::db::{self, Db};
use crate::error::ProcessError;
use crate::models::ProcessStatus;
use crate::scheduler::executor::{ProcessExecutor, RunOutcome};
use crate::scheduler::registry::ProcessRegistry;

// ---------------------------------------------------------------------------
// Queue stats (monitoring)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

// ---------------------------------------------------------------------------
// QueueManager
// ---------------------------------------------------------------------------

/// The admission/preemption state machine.
///
/// All admission decisions run under one async lock, so at most one process
/// is promoted at a time; the promoted process runs in a detached task that
/// reports back through `complete`/`fail`. Eviction is cooperative: the
/// victim keeps running until its next checkpoint observes the status flip.
pub struct QueueManager {
    db: Db,
    registry: ProcessRegistry,
    executor: Arc<ProcessExecutor>,
    clock: Arc<dyn Clock>,
    admission: tokio::sync::Mutex<()>,
    /// Process ids whose task has not finished draining yet. A re-admission
    /// of the same id is deferred until the stale task observes its eviction
    /// and exits, so one process never runs twice concurrently.
    live_tasks: parking_lot::Mutex<HashSet<i64>>,
    weak: Weak<Self>,
}

impl QueueManager {
    pub fn new(
        db: Db,
        registry: ProcessRegistry,
        executor: Arc<ProcessExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            db,
            registry,
            executor,
            clock,
            admission: tokio::sync::Mutex::new(()),
            live_tasks: parking_lot::Mutex::new(HashSet::new()),
            weak: weak.clone(),
        })
    }

    /// Called after creation; runs admission.
    pub async fn submit(&self, process_id: i64) {
        debug!(process_id, "Process submitted");
        self.admit().await;
    }

    /// Admission pass: promote the best queued row if the slot is free, or
    /// preempt the active process when a strictly better row is waiting.
    pub async fn admit(&self) {
        let _guard = self.admission.lock().await;
        if let Err(e) = self.admit_locked().await {
            error!(error = %e, "Admission pass failed");
            let _ = db::insert_system_log(&self.db, "error", "queue", &e.to_string()).await;
        }
    }

    async fn admit_locked(&self) -> Result<(), ProcessError> {
        let now_ms = self.clock.now_ms();
        let active = db::get_active_process(&self.db).await?;

        // Fast path while something is running: unless a strictly better
        // row is waiting, there is nothing to do.
        if let Some(active) = &active {
            if !db::has_higher_priority_queued(&self.db, active.priority, now_ms).await? {
                return Ok(());
            }
        }

        let Some(top) = db::get_next_queued_process(&self.db, now_ms).await? else {
            return Ok(());
        };

        match active {
            None => {
                if self.live_tasks.lock().contains(&top.id) {
                    // Its previous task is still draining after an eviction;
                    // the wake worker will re-admit shortly.
                    debug!(process_id = top.id, "Deferring re-admission until task drains");
                    return Ok(());
                }
                self.activate_and_launch(top.id).await
            }
            Some(active) if top.priority < active.priority => {
                info!(
                    victim = active.id,
                    victim_priority = active.priority,
                    preemptor = top.id,
                    preemptor_priority = top.priority,
                    "Preempting active process"
                );
                if !self.registry.set_preemption(active.id, top.id).await? {
                    // The victim finished or yielded in the meantime; the
                    // next pass will see a free slot.
                    return Ok(());
                }
                self.activate_and_launch(top.id).await
            }
            Some(_) => Ok(()),
        }
    }

    async fn activate_and_launch(&self, process_id: i64) -> Result<(), ProcessError> {
        self.registry
            .update_status(process_id, ProcessStatus::Active)
            .await?;
        self.launch(process_id);
        Ok(())
    }

    fn launch(&self, process_id: i64) {
        let Some(queue) = self.weak.upgrade() else {
            return;
        };
        self.live_tasks.lock().insert(process_id);
        tokio::spawn(async move {
            let outcome = queue.executor.run(process_id).await;
            queue.live_tasks.lock().remove(&process_id);
            match outcome {
                Ok(RunOutcome::Completed) => queue.complete(process_id).await,
                Ok(RunOutcome::Yielded) => {
                    debug!(process_id, "Process yielded; progress preserved");
                }
                Err(e) => queue.fail(process_id, e).await,
            }
        });
    }

    /// Terminal success; frees the slot and admits the next process.
    pub async fn complete(&self, process_id: i64) {
        match self
            .registry
            .update_status(process_id, ProcessStatus::Completed)
            .await
        {
            Ok(()) => info!(process_id, "Process completed"),
            Err(e) => error!(process_id, error = %e, "Failed to mark process completed"),
        }
        self.admit().await;
    }

    /// Terminal failure; logged to the system log, then the scheduler moves
    /// on to the next queued work.
    pub async fn fail(&self, process_id: i64, err: ProcessError) {
        error!(process_id, error = %err, "Process failed");
        let _ = db::insert_system_log(
            &self.db,
            "error",
            "process",
            &format!("process {process_id} failed: {err}"),
        )
        .await;

        if let Err(e) = self
            .registry
            .update_status(process_id, ProcessStatus::Failed)
            .await
        {
            error!(process_id, error = %e, "Failed to mark process failed");
        }
        self.admit().await;
    }

    /// Periodic wake worker. Re-runs admission so processes whose
    /// `resume_after` back-off has passed become candidates again; rows
    /// still inside their window are never admitted early because the
    /// candidate query excludes them.
    pub async fn run_wake_worker(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Queue wake worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.admit().await;
                }
                _ = shutdown.cancelled() => {
                    info!("Queue wake worker shutting down");
                    break;
                }
            }
        }
    }

    /// Queue statistics for the admin surface.
    pub async fn stats(&self) -> Result<QueueStats, sqlx::Error> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT \
                COUNT(*) FILTER (WHERE status = 'queued'), \
                COUNT(*) FILTER (WHERE status = 'active'), \
                COUNT(*) FILTER (WHERE status = 'completed'), \
                COUNT(*) FILTER (WHERE status = 'failed'), \
                COUNT(*) \
             FROM processes",
        )
        .fetch_one(self.db.reader())
        .await?;

        Ok(QueueStats {
            queued: row.0,
            active: row.1,
            completed: row.2,
            failed: row.3,
            total: row.4,
        })
    }
}
