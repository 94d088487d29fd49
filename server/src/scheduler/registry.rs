use tracing::debug;

use crate::db::{self, Db};
use crate::error::ProcessError;
use crate::models::{Process, ProcessAction, ProcessDetails, ProcessProgress, ProcessStatus};

/// Alliance priorities live in this band inside the redeem priority gap.
const MAX_ALLIANCE_PRIORITY: i64 = 99_999;

/// CRUD over process rows: creation with computed priority, status
/// transitions, progress writes, and the boot-time recovery sweep.
#[derive(Clone)]
pub struct ProcessRegistry {
    db: Db,
}

impl ProcessRegistry {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Scheduling priority for a new process; lower wins. Redeem work is
    /// offset by the alliance rank so a more-important alliance's redeem
    /// strictly precedes a less-important one's, while the 100k band gaps
    /// keep action kinds totally ordered between classes.
    pub fn priority_for(action: ProcessAction, alliance_priority: i64) -> Result<i64, ProcessError> {
        match action {
            ProcessAction::RedeemGiftcode => {
                if !(1..=MAX_ALLIANCE_PRIORITY).contains(&alliance_priority) {
                    return Err(ProcessError::InvalidRecord(format!(
                        "alliance priority {alliance_priority} outside 1..={MAX_ALLIANCE_PRIORITY}"
                    )));
                }
                Ok(action.priority_base() + alliance_priority)
            }
            _ => Ok(action.priority_base()),
        }
    }

    /// Create a queued process with every player id pending. Returns its id.
    pub async fn create(
        &self,
        action: ProcessAction,
        target: i64,
        alliance_priority: i64,
        player_ids: &[i64],
        gift_code: Option<String>,
        created_by: &str,
    ) -> Result<i64, ProcessError> {
        if target < 0 {
            return Err(ProcessError::InvalidRecord(format!(
                "target must be a non-negative alliance id, got {target}"
            )));
        }
        if action == ProcessAction::RedeemGiftcode && gift_code.is_none() {
            return Err(ProcessError::InvalidRecord(
                "redeem process requires a gift code".to_string(),
            ));
        }

        let priority = Self::priority_for(action, alliance_priority)?;
        let details = ProcessDetails {
            player_ids: player_ids.to_vec(),
            gift_code,
        };
        let progress = ProcessProgress::new_pending(player_ids);

        let id = db::insert_process(
            &self.db,
            action,
            target,
            priority,
            &serde_json::to_string(&details)?,
            &progress.to_json(),
            created_by,
        )
        .await?;

        debug!(process_id = id, action = %action, target, priority, "Process created");
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Process>, ProcessError> {
        Ok(db::get_process(&self.db, id).await?)
    }

    /// Apply a status transition. Activation and completion each go through
    /// guarded writes; a rejected write means the scheduler itself broke an
    /// invariant, which is surfaced as a programming error.
    pub async fn update_status(&self, id: i64, status: ProcessStatus) -> Result<(), ProcessError> {
        let applied = match status {
            ProcessStatus::Active => db::activate_process(&self.db, id).await?,
            ProcessStatus::Completed | ProcessStatus::Failed => {
                db::finish_process(&self.db, id, status).await?
            }
            ProcessStatus::Queued => {
                return Err(ProcessError::Invariant(
                    "transitions back to queued go through preemption or recovery".to_string(),
                ));
            }
        };

        if !applied {
            return Err(ProcessError::Invariant(format!(
                "rejected transition of process {id} to {status}"
            )));
        }
        Ok(())
    }

    /// Full-document progress replace, validated against the bucket set the
    /// action kind allows.
    pub async fn update_progress(
        &self,
        id: i64,
        action: ProcessAction,
        progress: &ProcessProgress,
    ) -> Result<(), ProcessError> {
        progress
            .validate_for(action)
            .map_err(ProcessError::Invariant)?;
        Ok(db::update_process_progress(&self.db, id, &progress.to_json()).await?)
    }

    /// Record when a rate-limit back-off ends; `None` clears it.
    pub async fn set_resume_after(&self, id: i64, resume_after: Option<i64>) -> Result<(), ProcessError> {
        Ok(db::set_process_resume_after(&self.db, id, resume_after).await?)
    }

    /// Evict an active process in favor of `preempted_by`. Returns false
    /// when the victim was no longer active (it already yielded or another
    /// preemption won the race).
    pub async fn set_preemption(&self, id: i64, preempted_by: i64) -> Result<bool, ProcessError> {
        Ok(db::set_process_preemption(&self.db, id, preempted_by).await?)
    }

    /// Boot-time crash-recovery sweep. Returns the number of requeued rows.
    pub async fn recover(&self) -> Result<u64, ProcessError> {
        Ok(db::recover_interrupted_processes(&self.db).await?)
    }
}
