//! The auto-refresh engine: per-alliance timers, single-flight tracking,
//! and the handler that walks an alliance roster against the remote API.
//!
//! Serves both process kinds that share the loop: `auto_refresh`
//! (scheduler-driven repeating) and `refresh` (one-shot on demand, higher
//! priority).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{FetchOutcome, PlayerApi, PlayerSnapshot};
use crate::budget::ApiBudget;
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{self, Db};
use crate::error::ProcessError;
use crate::interval::parse_refresh_interval;
use crate::models::{
    Alliance, Bucket, ChangeEntry, ChangeField, FieldChange, Player, Process, ProcessAction,
    ProcessProgress,
};
use crate::notify::{render_change_messages, NotificationSink, SinkError};
use crate::scheduler::{
    preemptable_sleep, ActionHandler, ProcessRegistry, QueueManager, RunOutcome, SleepOutcome,
    YieldCheck,
};
use crate::settings::Settings;

/// Consecutive transport failures tolerated for one fid before it is
/// written off as failed for this pass.
const MAX_TRANSIENT_RETRIES: u32 = 3;

struct ScheduledFire {
    handle: JoinHandle<()>,
    fire_at: DateTime<Utc>,
}

pub struct RefreshEngine {
    db: Db,
    registry: ProcessRegistry,
    queue: Arc<QueueManager>,
    api: Arc<dyn PlayerApi>,
    budget: Arc<ApiBudget>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    settings: Settings,
    config: Config,
    /// Alliances with an auto-refresh process in `queued` or `active`.
    /// Storage is the source of truth at boot; this map guards timer fires
    /// in between.
    active_refreshes: Mutex<HashSet<i64>>,
    /// One pending timer per alliance. Replacing a handle aborts the old
    /// timer first, so an alliance never has two.
    scheduled: Mutex<HashMap<i64, ScheduledFire>>,
    weak: Weak<Self>,
}

impl RefreshEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        registry: ProcessRegistry,
        queue: Arc<QueueManager>,
        api: Arc<dyn PlayerApi>,
        budget: Arc<ApiBudget>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        settings: Settings,
        config: Config,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            db,
            registry,
            queue,
            api,
            budget,
            clock,
            sink,
            settings,
            config,
            active_refreshes: Mutex::new(HashSet::new()),
            scheduled: Mutex::new(HashMap::new()),
            weak: weak.clone(),
        })
    }

    // -- Boot recovery ----------------------------------------------------------

    /// Re-arm timers at startup. Alliances with a recovered in-flight
    /// process keep their single-flight marker instead; their timer is
    /// re-armed when that process completes.
    pub async fn bootstrap(&self) -> Result<(), ProcessError> {
        let alliances = db::get_alliances_with_interval(&self.db).await?;
        let ids: Vec<i64> = alliances.iter().map(|a| a.id).collect();
        let counts: HashMap<i64, i64> = db::get_player_counts_by_alliance_ids(&self.db, &ids)
            .await?
            .into_iter()
            .collect();

        for alliance in alliances {
            if let Some(process) = db::find_refresh_in_flight(&self.db, alliance.id).await? {
                info!(
                    alliance_id = alliance.id,
                    process_id = process.id,
                    "Recovered in-flight auto-refresh; deferring timer"
                );
                self.active_refreshes.lock().insert(alliance.id);
                continue;
            }
            if counts.get(&alliance.id).copied().unwrap_or(0) == 0 {
                debug!(alliance_id = alliance.id, "No players; timer not armed");
                continue;
            }
            self.schedule_alliance(&alliance);
        }
        Ok(())
    }

    // -- Timer graph ------------------------------------------------------------

    /// Arm (or re-arm) the alliance's refresh timer from its current
    /// interval. An absent or invalid interval cancels any pending timer.
    pub fn schedule_alliance(&self, alliance: &Alliance) {
        let Some(raw) = alliance.interval.as_deref() else {
            self.cancel_schedule(alliance.id);
            return;
        };
        let interval = match parse_refresh_interval(raw) {
            Ok(interval) => interval,
            Err(e) => {
                warn!(alliance_id = alliance.id, error = %e, "Invalid refresh interval");
                self.cancel_schedule(alliance.id);
                return;
            }
        };

        let now = self.clock.now();
        let fire_at = interval
            .next_fire_after(now.with_timezone(&Local))
            .with_timezone(&Utc);
        let delay = (fire_at - now).to_std().unwrap_or(Duration::ZERO);

        let weak = self.weak.clone();
        let clock = Arc::clone(&self.clock);
        let alliance_id = alliance.id;
        let handle = tokio::spawn(async move {
            clock.sleep(delay).await;
            if let Some(engine) = weak.upgrade() {
                engine.fire(alliance_id).await;
            }
        });

        if let Some(previous) = self
            .scheduled
            .lock()
            .insert(alliance_id, ScheduledFire { handle, fire_at })
        {
            previous.handle.abort();
        }
        debug!(alliance_id, fire_at = %fire_at, "Refresh timer armed");
    }

    pub fn cancel_schedule(&self, alliance_id: i64) {
        if let Some(fire) = self.scheduled.lock().remove(&alliance_id) {
            fire.handle.abort();
        }
    }

    pub fn next_scheduled_fire(&self, alliance_id: i64) -> Option<DateTime<Utc>> {
        self.scheduled.lock().get(&alliance_id).map(|f| f.fire_at)
    }

    pub fn is_refresh_in_flight(&self, alliance_id: i64) -> bool {
        self.active_refreshes.lock().contains(&alliance_id)
    }

    /// Timer fire: create and submit the alliance's auto-refresh process.
    /// A fire while one is already queued or active is an idempotent no-op.
    pub async fn fire(&self, alliance_id: i64) {
        {
            let mut active = self.active_refreshes.lock();
            if active.contains(&alliance_id) {
                debug!(alliance_id, "Refresh already in flight; skipping fire");
                return;
            }
            active.insert(alliance_id);
        }
        self.scheduled.lock().remove(&alliance_id);

        match self.create_auto_refresh(alliance_id).await {
            Ok(true) => {}
            Ok(false) => {
                self.active_refreshes.lock().remove(&alliance_id);
            }
            Err(e) => {
                error!(alliance_id, error = %e, "Failed to create auto-refresh process");
                let _ = db::insert_system_log(&self.db, "error", "refresh", &e.to_string()).await;
                self.active_refreshes.lock().remove(&alliance_id);
            }
        }
    }

    /// Returns true when a process was created and submitted.
    async fn create_auto_refresh(&self, alliance_id: i64) -> Result<bool, ProcessError> {
        let Some(alliance) = db::get_alliance(&self.db, alliance_id).await? else {
            debug!(alliance_id, "Alliance gone; dropping refresh timer");
            return Ok(false);
        };
        let players = db::get_players_by_alliance(&self.db, alliance_id).await?;
        if players.is_empty() {
            // Nothing to refresh now; keep the cadence for when the roster
            // fills up again.
            self.schedule_alliance(&alliance);
            return Ok(false);
        }

        let fids: Vec<i64> = players.iter().map(|p| p.fid).collect();
        let id = self
            .registry
            .create(
                ProcessAction::AutoRefresh,
                alliance.id,
                alliance.priority,
                &fids,
                None,
                "scheduler",
            )
            .await?;
        self.queue.submit(id).await;
        Ok(true)
    }

    // -- The refresh pass -------------------------------------------------------

    async fn run_refresh(
        &self,
        process: &Process,
        yield_check: &YieldCheck,
    ) -> Result<RunOutcome, ProcessError> {
        // The alliance may have been edited or deleted since creation;
        // always work from the current row.
        let Some(alliance) = db::get_alliance(&self.db, process.target).await? else {
            info!(
                process_id = process.id,
                alliance_id = process.target,
                "Alliance deleted; refresh exits cleanly"
            );
            return Ok(RunOutcome::Completed);
        };

        let mut progress = process.progress()?;
        let mut transient_attempts: HashMap<i64, u32> = HashMap::new();

        // Pick up change entries an earlier pass detected but never
        // delivered, so a failed send is retried on the next admission.
        match db::take_unsent_changes(&self.db, process.target).await {
            Ok(restored) if !restored.is_empty() => {
                info!(
                    process_id = process.id,
                    restored = restored.len(),
                    "Restored undelivered change notifications"
                );
                let mut entries = restored;
                entries.append(&mut progress.detected_changes);
                progress.detected_changes = entries;
                self.persist_progress(process, &progress).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(process_id = process.id, error = %e, "Failed to restore undelivered changes");
            }
        }

        while let Some(fid) = progress.pending.first().copied() {
            if yield_check.should_yield().await {
                self.persist_progress(process, &progress).await;
                return Ok(RunOutcome::Yielded);
            }

            let Some(player) = db::get_player(&self.db, fid).await? else {
                // Deleted mid-flight.
                progress.transition(fid, Bucket::Failed);
                self.persist_progress(process, &progress).await;
                continue;
            };

            self.budget.acquire().await;
            match self.api.fetch(fid).await {
                Ok(FetchOutcome::Snapshot(snapshot)) => {
                    match self.apply_snapshot(&player, &snapshot, &mut progress).await {
                        Ok(()) => {
                            self.persist_progress(process, &progress).await;
                            transient_attempts.remove(&fid);
                        }
                        Err(e) => {
                            // Storage hiccup: log and retry the same fid on
                            // the next iteration; persistent failure fails
                            // the process so the scheduler moves on.
                            let attempts = transient_attempts.entry(fid).or_insert(0);
                            *attempts += 1;
                            if *attempts >= MAX_TRANSIENT_RETRIES {
                                return Err(e);
                            }
                            error!(fid, error = %e, "Failed to persist refresh outcome; retrying");
                            let _ = db::insert_system_log(&self.db, "error", "refresh", &e.to_string())
                                .await;
                        }
                    }
                }
                Ok(FetchOutcome::RoleNotExist) => {
                    self.record_strike(&player).await?;
                    progress.transition(fid, Bucket::Done);
                    self.persist_progress(process, &progress).await;
                }
                Ok(FetchOutcome::RateLimited) => {
                    // Persist first so an eviction during the back-off
                    // loses nothing; the same fid is retried afterwards.
                    self.persist_progress(process, &progress).await;
                    if self.backoff(process, yield_check).await == SleepOutcome::Preempted {
                        return Ok(RunOutcome::Yielded);
                    }
                }
                Err(e) if e.is_retryable() => {
                    let attempts = transient_attempts.entry(fid).or_insert(0);
                    *attempts += 1;
                    if *attempts >= MAX_TRANSIENT_RETRIES {
                        warn!(fid, error = %e, "Giving up on player after repeated transport failures");
                        progress.transition(fid, Bucket::Failed);
                        self.persist_progress(process, &progress).await;
                        transient_attempts.remove(&fid);
                    } else {
                        debug!(fid, attempt = *attempts, error = %e, "Transient API failure; retrying");
                        self.persist_progress(process, &progress).await;
                        if self.backoff(process, yield_check).await == SleepOutcome::Preempted {
                            return Ok(RunOutcome::Yielded);
                        }
                    }
                }
                Err(e) => {
                    warn!(fid, error = %e, "Remote rejected player fetch");
                    progress.transition(fid, Bucket::Failed);
                    self.persist_progress(process, &progress).await;
                }
            }
        }

        // Completed without preemption: emit what the pass detected, then
        // clear the records so the next pass does not repeat them. A failed
        // send keeps them for the next admission instead.
        if !progress.detected_changes.is_empty() {
            match self.emit_notifications(&alliance, &progress.detected_changes).await {
                Ok(()) => {
                    progress.detected_changes.clear();
                    self.persist_progress(process, &progress).await;
                }
                Err(e) => {
                    warn!(
                        alliance_id = alliance.id,
                        error = %e,
                        "Notification delivery failed; retrying on next pass"
                    );
                }
            }
        }

        Ok(RunOutcome::Completed)
    }

    /// Rate-limit back-off: record when the process becomes eligible again,
    /// then sleep in preemption-aware quanta. If evicted mid-back-off the
    /// wake worker re-admits only after `resume_after` passes.
    async fn backoff(&self, process: &Process, yield_check: &YieldCheck) -> SleepOutcome {
        let resume_at = self.clock.now_ms() + self.config.rate_limit_delay.as_millis() as i64;
        if let Err(e) = self.registry.set_resume_after(process.id, Some(resume_at)).await {
            warn!(process_id = process.id, error = %e, "Failed to record resume_after");
        }

        let outcome =
            preemptable_sleep(self.clock.as_ref(), yield_check, self.config.rate_limit_delay).await;

        if outcome == SleepOutcome::Slept {
            if let Err(e) = self.registry.set_resume_after(process.id, None).await {
                warn!(process_id = process.id, error = %e, "Failed to clear resume_after");
            }
        }
        outcome
    }

    async fn record_strike(&self, player: &Player) -> Result<(), ProcessError> {
        let strikes = player.exist + 1;
        if strikes >= self.config.exist_threshold && self.settings.auto_delete().await {
            info!(
                fid = player.fid,
                strikes, "Player past non-existence threshold; deleting"
            );
            db::delete_player(&self.db, player.fid).await?;
        } else {
            db::set_player_exist(&self.db, player.fid, strikes).await?;
        }
        Ok(())
    }

    /// Diff the stored player against the snapshot, apply the update and
    /// history rows in one transaction, and stage the change entry for
    /// notification before the progress bucket moves.
    async fn apply_snapshot(
        &self,
        player: &Player,
        snapshot: &PlayerSnapshot,
        progress: &mut ProcessProgress,
    ) -> Result<(), ProcessError> {
        let nickname = normalize_nickname(snapshot.nickname.as_deref());
        let changes = diff_player(player, &nickname, snapshot.stove_lv, snapshot.kid);

        db::apply_player_refresh(
            &self.db,
            player.fid,
            &nickname,
            snapshot.stove_lv,
            snapshot.kid,
            &changes,
        )
        .await?;

        if changes.is_empty() {
            progress.transition(player.fid, Bucket::Unchanged);
        } else {
            progress.detected_changes.push(ChangeEntry {
                fid: player.fid,
                nickname: nickname.clone(),
                changes,
            });
            progress.transition(player.fid, Bucket::Changed);
        }
        Ok(())
    }

    async fn emit_notifications(
        &self,
        alliance: &Alliance,
        entries: &[ChangeEntry],
    ) -> Result<(), SinkError> {
        let Some(channel_id) = alliance.channel_id.as_deref() else {
            // No channel configured; nothing to deliver.
            return Ok(());
        };

        let messages = render_change_messages(
            &alliance.name,
            entries,
            self.config.max_embeds_per_message,
            self.config.max_description_length,
        );
        for (i, message) in messages.iter().enumerate() {
            if i > 0 {
                self.clock.sleep(self.config.notify_delay).await;
            }
            self.sink.send(channel_id, message).await?;
        }
        info!(
            alliance_id = alliance.id,
            players = entries.len(),
            messages = messages.len(),
            "Change notifications sent"
        );
        Ok(())
    }

    async fn persist_progress(&self, process: &Process, progress: &ProcessProgress) {
        if let Err(e) = self
            .registry
            .update_progress(process.id, process.action, progress)
            .await
        {
            // Progress writes must not take the scheduler down; the next
            // iteration rewrites the whole document anyway.
            error!(process_id = process.id, error = %e, "Progress write failed");
            let _ = db::insert_system_log(&self.db, "error", "refresh", &e.to_string()).await;
        }
    }

    /// Post-terminal bookkeeping: drop the single-flight marker and re-arm
    /// the timer from the *current* alliance row. A manual refresh re-arms
    /// too, for any valid interval, so an alliance on a daily `@HH:MM`
    /// cadence keeps refreshing after an on-demand pass.
    async fn finish_pass(&self, action: ProcessAction, alliance_id: i64) {
        if action == ProcessAction::AutoRefresh {
            self.active_refreshes.lock().remove(&alliance_id);
        }
        match db::get_alliance(&self.db, alliance_id).await {
            Ok(Some(alliance)) => {
                let rearm = match action {
                    ProcessAction::AutoRefresh => true,
                    ProcessAction::Refresh => alliance.channel_id.is_some(),
                    _ => false,
                };
                if rearm {
                    self.schedule_alliance(&alliance);
                }
            }
            Ok(None) => self.cancel_schedule(alliance_id),
            Err(e) => {
                warn!(alliance_id, error = %e, "Failed to reload alliance for rescheduling");
            }
        }
    }
}

#[async_trait]
impl ActionHandler for RefreshEngine {
    async fn run(
        &self,
        process: &Process,
        yield_check: &YieldCheck,
    ) -> Result<RunOutcome, ProcessError> {
        let result = self.run_refresh(process, yield_check).await;
        match result {
            // Still in flight; marker and timer stay as they are.
            Ok(RunOutcome::Yielded) => {}
            _ => self.finish_pass(process.action, process.target).await,
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Diffing
// ---------------------------------------------------------------------------

fn normalize_nickname(nickname: Option<&str>) -> String {
    match nickname {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => "Unknown".to_string(),
    }
}

/// Field-by-field diff of the stored player against a normalized snapshot.
/// Any value inequality is a change; no thresholds, no debounce.
fn diff_player(player: &Player, nickname: &str, furnace_level: i64, state: i64) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    if player.nickname != nickname {
        changes.push(FieldChange {
            field: ChangeField::Nickname,
            old: player.nickname.clone(),
            new: nickname.to_string(),
        });
    }
    if player.furnace_level != furnace_level {
        changes.push(FieldChange {
            field: ChangeField::FurnaceLevel,
            old: player.furnace_level.to_string(),
            new: furnace_level.to_string(),
        });
    }
    if player.state != state {
        changes.push(FieldChange {
            field: ChangeField::State,
            old: player.state.to_string(),
            new: state.to_string(),
        });
    }
    changes
}
