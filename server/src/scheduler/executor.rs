use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::db::{self, Db};
use crate::error::ProcessError;
use crate::models::{Process, ProcessAction, ProcessStatus};

/// Longest uninterruptible stretch inside a back-off sleep. Preemption is
/// observed between quanta, so this bounds preemption latency.
pub const YIELD_QUANTUM: Duration = Duration::from_secs(2);

/// How an admission ended from the handler's point of view.
///
/// `Yielded` is the cooperative exit: the process was evicted (or found
/// itself already evicted) and its progress is persisted; it is not an
/// error and the process must not be marked done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Yielded,
}

/// Cancellation token derived from the store's view of the process status.
/// One call at each cooperative checkpoint suffices.
pub struct YieldCheck {
    db: Db,
    process_id: i64,
}

impl YieldCheck {
    pub fn new(db: Db, process_id: i64) -> Self {
        Self { db, process_id }
    }

    /// True when the process is no longer active and the handler must
    /// return `Yielded`. A read failure keeps the handler running; the
    /// next checkpoint re-reads.
    pub async fn should_yield(&self) -> bool {
        match db::get_process(&self.db, self.process_id).await {
            Ok(Some(process)) => process.status != ProcessStatus::Active,
            Ok(None) => true,
            Err(e) => {
                warn!(process_id = self.process_id, error = %e, "Preemption check read failed");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Slept,
    Preempted,
}

/// Sleep `total` in preemption-aware quanta, re-checking eviction between
/// them. Returns early with `Preempted` the moment the check trips.
pub async fn preemptable_sleep(
    clock: &dyn Clock,
    check: &YieldCheck,
    total: Duration,
) -> SleepOutcome {
    let mut remaining = total;
    while !remaining.is_zero() {
        if check.should_yield().await {
            return SleepOutcome::Preempted;
        }
        let step = remaining.min(YIELD_QUANTUM);
        clock.sleep(step).await;
        remaining -= step;
    }
    if check.should_yield().await {
        return SleepOutcome::Preempted;
    }
    SleepOutcome::Slept
}

/// Per-kind work implementation. Handlers own their loops, persist their
/// own progress, and consult the yield check between externally-visible
/// steps.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn run(&self, process: &Process, yield_check: &YieldCheck)
        -> Result<RunOutcome, ProcessError>;
}

/// Dispatches an admitted process to the handler registered for its action
/// kind. Handlers are registered once at startup, after the components they
/// close over have been wired up.
pub struct ProcessExecutor {
    db: Db,
    handlers: OnceCell<HashMap<ProcessAction, Arc<dyn ActionHandler>>>,
}

impl ProcessExecutor {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            handlers: OnceCell::new(),
        }
    }

    pub fn register_handlers(&self, handlers: HashMap<ProcessAction, Arc<dyn ActionHandler>>) {
        if self.handlers.set(handlers).is_err() {
            error!("Handler registry initialized twice; keeping the first registration");
        }
    }

    pub async fn run(&self, process_id: i64) -> Result<RunOutcome, ProcessError> {
        let process = db::get_process(&self.db, process_id)
            .await?
            .ok_or_else(|| {
                ProcessError::InvalidRecord(format!("process {process_id} vanished before dispatch"))
            })?;

        match process.status {
            ProcessStatus::Active => {}
            // Evicted between launch and load; the preemptor is running.
            ProcessStatus::Queued => return Ok(RunOutcome::Yielded),
            status => {
                return Err(ProcessError::Invariant(format!(
                    "process {process_id} dispatched while {status}"
                )));
            }
        }

        let handler = self
            .handlers
            .get()
            .and_then(|handlers| handlers.get(&process.action))
            .cloned()
            .ok_or_else(|| ProcessError::UnknownAction(process.action.to_string()))?;

        let yield_check = YieldCheck::new(self.db.clone(), process_id);
        handler.run(&process, &yield_check).await
    }
}
