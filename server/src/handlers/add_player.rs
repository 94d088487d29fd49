//! Roster additions: fetch each pending fid once and insert it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::api::{FetchOutcome, PlayerApi};
use crate::budget::ApiBudget;
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{self, Db};
use crate::error::ProcessError;
use crate::models::{Bucket, Player, Process, ProcessProgress};
use crate::scheduler::{
    preemptable_sleep, ActionHandler, ProcessRegistry, RunOutcome, SleepOutcome, YieldCheck,
};

const MAX_TRANSIENT_RETRIES: u32 = 3;

pub struct AddPlayerHandler {
    db: Db,
    registry: ProcessRegistry,
    api: Arc<dyn PlayerApi>,
    budget: Arc<ApiBudget>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl AddPlayerHandler {
    pub fn new(
        db: Db,
        registry: ProcessRegistry,
        api: Arc<dyn PlayerApi>,
        budget: Arc<ApiBudget>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        Self {
            db,
            registry,
            api,
            budget,
            clock,
            config,
        }
    }

    async fn persist_progress(&self, process: &Process, progress: &ProcessProgress) {
        if let Err(e) = self
            .registry
            .update_progress(process.id, process.action, progress)
            .await
        {
            warn!(process_id = process.id, error = %e, "Progress write failed");
            let _ = db::insert_system_log(&self.db, "error", "addplayer", &e.to_string()).await;
        }
    }
}

#[async_trait]
impl ActionHandler for AddPlayerHandler {
    async fn run(
        &self,
        process: &Process,
        yield_check: &YieldCheck,
    ) -> Result<RunOutcome, ProcessError> {
        let mut progress = process.progress()?;
        let mut transient_attempts: HashMap<i64, u32> = HashMap::new();

        while let Some(fid) = progress.pending.first().copied() {
            if yield_check.should_yield().await {
                self.persist_progress(process, &progress).await;
                return Ok(RunOutcome::Yielded);
            }

            if db::get_player(&self.db, fid).await?.is_some() {
                progress.transition(fid, Bucket::Existing);
                self.persist_progress(process, &progress).await;
                continue;
            }

            self.budget.acquire().await;
            match self.api.fetch(fid).await {
                Ok(FetchOutcome::Snapshot(snapshot)) => {
                    let nickname = snapshot
                        .nickname
                        .filter(|name| !name.trim().is_empty())
                        .unwrap_or_else(|| "Unknown".to_string());
                    let inserted = db::insert_player(
                        &self.db,
                        &Player {
                            fid,
                            alliance_id: process.target,
                            nickname,
                            furnace_level: snapshot.stove_lv,
                            state: snapshot.kid,
                            exist: 0,
                            is_rich: false,
                            vip_count: 0,
                        },
                    )
                    .await?;

                    let bucket = if inserted { Bucket::Done } else { Bucket::Existing };
                    progress.transition(fid, bucket);
                    self.persist_progress(process, &progress).await;
                    transient_attempts.remove(&fid);
                    debug!(fid, inserted, "Player add processed");
                }
                Ok(FetchOutcome::RoleNotExist) => {
                    // Nothing to add for an id the game does not know.
                    progress.transition(fid, Bucket::Failed);
                    self.persist_progress(process, &progress).await;
                }
                Ok(FetchOutcome::RateLimited) => {
                    self.persist_progress(process, &progress).await;
                    let outcome = preemptable_sleep(
                        self.clock.as_ref(),
                        yield_check,
                        self.config.rate_limit_delay,
                    )
                    .await;
                    if outcome == SleepOutcome::Preempted {
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
                        self.persist_progress(process, &progress).await;
                        let outcome = preemptable_sleep(
                            self.clock.as_ref(),
                            yield_check,
                            self.config.rate_limit_delay,
                        )
                        .await;
                        if outcome == SleepOutcome::Preempted {
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

        Ok(RunOutcome::Completed)
    }
}
