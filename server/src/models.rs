//! Database models and the process progress document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// =============================================================================
// Process
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessAction {
    #[sqlx(rename = "addplayer")]
    #[serde(rename = "addplayer")]
    AddPlayer,
    Refresh,
    AutoRefresh,
    RedeemGiftcode,
}

impl ProcessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessAction::AddPlayer => "addplayer",
            ProcessAction::Refresh => "refresh",
            ProcessAction::AutoRefresh => "auto_refresh",
            ProcessAction::RedeemGiftcode => "redeem_giftcode",
        }
    }

    /// Base of the priority band for this action kind. Lower wins; the 100k
    /// gaps keep action kinds totally ordered between classes, and the
    /// redeem band adds the alliance rank inside its gap.
    pub fn priority_base(&self) -> i64 {
        match self {
            ProcessAction::AddPlayer => 100_000,
            ProcessAction::RedeemGiftcode => 200_000,
            ProcessAction::Refresh => 300_000,
            ProcessAction::AutoRefresh => 400_000,
        }
    }
}

impl std::fmt::Display for ProcessAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Queued,
    Active,
    Completed,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Completed | ProcessStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Queued => "queued",
            ProcessStatus::Active => "active",
            ProcessStatus::Completed => "completed",
            ProcessStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of a unit of work. `details` and `progress` are JSON
/// documents; use [`Process::details`] and [`Process::progress`] to decode.
#[derive(Debug, Clone, FromRow)]
pub struct Process {
    pub id: i64,
    pub action: ProcessAction,
    /// Alliance id the work targets; 0 is allowed for system validations.
    pub target: i64,
    pub status: ProcessStatus,
    pub priority: i64,
    pub details: String,
    pub progress: String,
    /// Earliest epoch-millisecond instant this process may be re-admitted.
    pub resume_after: Option<i64>,
    /// Id of the process that evicted this one, while it waits re-admission.
    pub preempted_by: Option<i64>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Process {
    pub fn details(&self) -> Result<ProcessDetails, serde_json::Error> {
        serde_json::from_str(&self.details)
    }

    pub fn progress(&self) -> Result<ProcessProgress, serde_json::Error> {
        serde_json::from_str(&self.progress)
    }
}

/// Action-specific payload. Every kind carries the player ids it operates
/// on; redeem additionally carries the gift code.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessDetails {
    pub player_ids: Vec<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gift_code: Option<String>,
}

// =============================================================================
// Process progress
// =============================================================================

/// Outcome bucket of a single player id within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Pending,
    Done,
    Failed,
    Existing,
    Changed,
    Unchanged,
}

/// The progress document attached to a process.
///
/// Buckets are ordered, duplicate-free sets of player ids; together they
/// partition the original id set of the process. `detected_changes` is an
/// auxiliary list of change records awaiting notification emission, not a
/// bucket.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessProgress {
    #[serde(default)]
    pub pending: Vec<i64>,
    #[serde(default)]
    pub done: Vec<i64>,
    #[serde(default)]
    pub failed: Vec<i64>,
    #[serde(default)]
    pub existing: Vec<i64>,
    #[serde(default)]
    pub changed: Vec<i64>,
    #[serde(default)]
    pub unchanged: Vec<i64>,
    #[serde(
        default,
        rename = "detectedChanges",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub detected_changes: Vec<ChangeEntry>,
}

impl ProcessProgress {
    /// Fresh progress with every id pending, deduplicated, order preserved.
    pub fn new_pending(player_ids: &[i64]) -> Self {
        let mut pending = Vec::with_capacity(player_ids.len());
        for &fid in player_ids {
            if !pending.contains(&fid) {
                pending.push(fid);
            }
        }
        Self {
            pending,
            ..Default::default()
        }
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<i64> {
        match bucket {
            Bucket::Pending => &mut self.pending,
            Bucket::Done => &mut self.done,
            Bucket::Failed => &mut self.failed,
            Bucket::Existing => &mut self.existing,
            Bucket::Changed => &mut self.changed,
            Bucket::Unchanged => &mut self.unchanged,
        }
    }

    /// Move `fid` into `bucket`, removing it from whichever bucket holds it.
    /// Keeps the partition invariant: an id lives in exactly one bucket.
    pub fn transition(&mut self, fid: i64, bucket: Bucket) {
        for b in [
            Bucket::Pending,
            Bucket::Done,
            Bucket::Failed,
            Bucket::Existing,
            Bucket::Changed,
            Bucket::Unchanged,
        ] {
            self.bucket_mut(b).retain(|&id| id != fid);
        }
        self.bucket_mut(bucket).push(fid);
    }

    pub fn bucket_of(&self, fid: i64) -> Option<Bucket> {
        let buckets = [
            (Bucket::Pending, &self.pending),
            (Bucket::Done, &self.done),
            (Bucket::Failed, &self.failed),
            (Bucket::Existing, &self.existing),
            (Bucket::Changed, &self.changed),
            (Bucket::Unchanged, &self.unchanged),
        ];
        buckets
            .iter()
            .find(|(_, ids)| ids.contains(&fid))
            .map(|(b, _)| *b)
    }

    pub fn total(&self) -> usize {
        self.pending.len()
            + self.done.len()
            + self.failed.len()
            + self.existing.len()
            + self.changed.len()
            + self.unchanged.len()
    }

    /// Validate the document against the bucket set its action kind allows,
    /// and against the no-duplicates half of the partition invariant.
    pub fn validate_for(&self, action: ProcessAction) -> Result<(), String> {
        match action {
            ProcessAction::AddPlayer => {
                if !self.changed.is_empty() || !self.unchanged.is_empty() {
                    return Err("addplayer progress may not use changed/unchanged".into());
                }
                if !self.detected_changes.is_empty() {
                    return Err("addplayer progress may not carry detected changes".into());
                }
            }
            ProcessAction::Refresh | ProcessAction::AutoRefresh => {
                if !self.existing.is_empty() {
                    return Err("refresh progress may not use the existing bucket".into());
                }
            }
            ProcessAction::RedeemGiftcode => {
                if !self.existing.is_empty()
                    || !self.changed.is_empty()
                    || !self.unchanged.is_empty()
                {
                    return Err("redeem progress uses only pending/done/failed".into());
                }
                if !self.detected_changes.is_empty() {
                    return Err("redeem progress may not carry detected changes".into());
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for ids in [
            &self.pending,
            &self.done,
            &self.failed,
            &self.existing,
            &self.changed,
            &self.unchanged,
        ] {
            for &fid in ids.iter() {
                if !seen.insert(fid) {
                    return Err(format!("player {fid} appears in more than one bucket"));
                }
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

// =============================================================================
// Detected changes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeField {
    Nickname,
    FurnaceLevel,
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: ChangeField,
    pub old: String,
    pub new: String,
}

/// One player's diff outcome from a refresh pass, persisted inside the
/// progress document until its notification has been emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub fid: i64,
    pub nickname: String,
    pub changes: Vec<FieldChange>,
}

// =============================================================================
// Roster rows
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct Alliance {
    pub id: i64,
    /// Rank used as a scheduling tiebreaker for redeem work; 1 is the most
    /// important alliance.
    pub priority: i64,
    pub name: String,
    pub channel_id: Option<String>,
    /// Raw interval string: minutes or `@HH:MM`. NULL disables auto-refresh.
    pub interval: Option<String>,
    pub auto_redeem: bool,
}

#[derive(Debug, Clone, FromRow)]
pub struct Player {
    pub fid: i64,
    pub alliance_id: i64,
    pub nickname: String,
    pub furnace_level: i64,
    pub state: i64,
    /// Consecutive "role not exist" strikes from the remote API.
    pub exist: i64,
    pub is_rich: bool,
    pub vip_count: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct GiftcodeUsage {
    pub fid: i64,
    pub gift_code: String,
    pub status: String,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SystemLog {
    pub id: i64,
    pub level: String,
    pub source: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AdminLog {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_starts_all_pending_without_duplicates() {
        let progress = ProcessProgress::new_pending(&[1, 2, 2, 3]);
        assert_eq!(progress.pending, vec![1, 2, 3]);
        assert_eq!(progress.total(), 3);
    }

    #[test]
    fn transition_keeps_partition() {
        let mut progress = ProcessProgress::new_pending(&[1, 2, 3]);
        progress.transition(2, Bucket::Done);
        progress.transition(2, Bucket::Failed);
        assert_eq!(progress.bucket_of(2), Some(Bucket::Failed));
        assert_eq!(progress.total(), 3);
        assert!(progress.validate_for(ProcessAction::Refresh).is_ok());
    }

    #[test]
    fn bucket_set_depends_on_action() {
        let mut progress = ProcessProgress::new_pending(&[1]);
        progress.transition(1, Bucket::Existing);
        assert!(progress.validate_for(ProcessAction::AddPlayer).is_ok());
        assert!(progress.validate_for(ProcessAction::Refresh).is_err());
        assert!(progress.validate_for(ProcessAction::RedeemGiftcode).is_err());
    }

    #[test]
    fn duplicate_across_buckets_is_rejected() {
        let progress = ProcessProgress {
            pending: vec![7],
            done: vec![7],
            ..Default::default()
        };
        assert!(progress.validate_for(ProcessAction::Refresh).is_err());
    }

    #[test]
    fn progress_round_trips_through_json() {
        let mut progress = ProcessProgress::new_pending(&[10, 20]);
        progress.transition(10, Bucket::Changed);
        progress.detected_changes.push(ChangeEntry {
            fid: 10,
            nickname: "Snowdrift".into(),
            changes: vec![FieldChange {
                field: ChangeField::FurnaceLevel,
                old: "29".into(),
                new: "30".into(),
            }],
        });
        let decoded: ProcessProgress = serde_json::from_str(&progress.to_json()).unwrap();
        assert_eq!(decoded, progress);
    }

    #[test]
    fn priority_bases_are_totally_ordered() {
        assert!(ProcessAction::AddPlayer.priority_base() < ProcessAction::RedeemGiftcode.priority_base());
        assert!(ProcessAction::RedeemGiftcode.priority_base() < ProcessAction::Refresh.priority_base());
        assert!(ProcessAction::Refresh.priority_base() < ProcessAction::AutoRefresh.priority_base());
    }
}
