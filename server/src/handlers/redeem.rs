//! Gift-code redemption: one redeem call per pending fid, with a bulk
//! pre-filter so already-redeemed players never cost an API call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::api::{PlayerApi, RedeemOutcome};
use crate::budget::ApiBudget;
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{self, Db};
use crate::error::ProcessError;
use crate::models::{Bucket, Process, ProcessProgress};
use crate::scheduler::{
    preemptable_sleep, ActionHandler, ProcessRegistry, RunOutcome, SleepOutcome, YieldCheck,
};

const MAX_TRANSIENT_RETRIES: u32 = 3;

pub struct RedeemHandler {
    db: Db,
    registry: ProcessRegistry,
    api: Arc<dyn PlayerApi>,
    budget: Arc<ApiBudget>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl RedeemHandler {
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
            let _ = db::insert_system_log(&self.db, "error", "redeem", &e.to_string()).await;
        }
    }
}

#[async_trait]
impl ActionHandler for RedeemHandler {
    async fn run(
        &self,
        process: &Process,
        yield_check: &YieldCheck,
    ) -> Result<RunOutcome, ProcessError> {
        let details = process.details()?;
        let code = details.gift_code.ok_or_else(|| {
            ProcessError::InvalidRecord(format!("redeem process {} has no gift code", process.id))
        })?;

        let mut progress = process.progress()?;
        let mut transient_attempts: HashMap<i64, u32> = HashMap::new();

        // Players who already hold the code skip straight to done; a fully
        // redeemed code costs zero API calls.
        let already = db::check_bulk_usage(&self.db, &code, &progress.pending).await?;
        if !already.is_empty() {
            debug!(
                process_id = process.id,
                code = %code,
                skipped = already.len(),
                "Skipping players who already redeemed"
            );
            for fid in already {
                progress.transition(fid, Bucket::Done);
            }
            self.persist_progress(process, &progress).await;
        }

        while let Some(fid) = progress.pending.first().copied() {
            if yield_check.should_yield().await {
                self.persist_progress(process, &progress).await;
                return Ok(RunOutcome::Yielded);
            }

            self.budget.acquire().await;
            match self.api.redeem(fid, &code).await {
                Ok(RedeemOutcome::RateLimited) => {
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
                Ok(outcome) if outcome.counts_as_redeemed() => {
                    db::insert_giftcode_usage(&self.db, fid, &code, outcome.as_str()).await?;
                    progress.transition(fid, Bucket::Done);
                    self.persist_progress(process, &progress).await;
                    transient_attempts.remove(&fid);
                }
                Ok(outcome) if outcome.kills_code() => {
                    // Dead code: every remaining attempt would fail the
                    // same way, so fail them all and stop calling out.
                    info!(
                        process_id = process.id,
                        code = %code,
                        reason = outcome.as_str(),
                        "Gift code is dead; failing remaining players"
                    );
                    for remaining in std::mem::take(&mut progress.pending) {
                        progress.failed.push(remaining);
                    }
                    self.persist_progress(process, &progress).await;
                    break;
                }
                Ok(outcome) => {
                    warn!(fid, code = %code, reason = outcome.as_str(), "Redeem rejected for player");
                    progress.transition(fid, Bucket::Failed);
                    self.persist_progress(process, &progress).await;
                }
                Err(e) if e.is_retryable() => {
                    let attempts = transient_attempts.entry(fid).or_insert(0);
                    *attempts += 1;
                    if *attempts >= MAX_TRANSIENT_RETRIES {
                        warn!(fid, error = %e, "Giving up on redeem after repeated transport failures");
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
                    warn!(fid, error = %e, "Redeem call failed");
                    progress.transition(fid, Bucket::Failed);
                    self.persist_progress(process, &progress).await;
                }
            }
        }

        Ok(RunOutcome::Completed)
    }
}
