//! Shared test doubles: a scripted game API, a capturing notification
//! sink, and a recording handler for admission-order assertions.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use frostwarden_server::api::{ApiError, FetchOutcome, PlayerApi, PlayerSnapshot, RedeemOutcome};
use frostwarden_server::config::Config;
use frostwarden_server::error::ProcessError;
use frostwarden_server::models::Process;
use frostwarden_server::notify::{ChannelMessage, NotificationSink, SinkError};
use frostwarden_server::scheduler::{ActionHandler, RunOutcome, YieldCheck};

pub fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".to_string(),
        server_port: 0,
        per_call_delay: Duration::from_millis(2000),
        rate_limit_delay: Duration::from_millis(60_000),
        wake_interval: Duration::from_millis(100),
        notify_delay: Duration::from_millis(2000),
        max_embeds_per_message: 10,
        max_description_length: 4096,
        exist_threshold: 3,
        game_api_base: "https://api.example.test".to_string(),
        game_api_secret: String::new(),
        webhook_url: None,
    }
}

/// Scripted remote API. Per-fid fetch outcomes are consumed front to back;
/// an exhausted or missing script falls back to a deterministic snapshot.
/// With gating enabled every call first waits for a permit issued through
/// [`ScriptedApi::allow`], which lets a test single-step a handler.
pub struct ScriptedApi {
    fetch_script: Mutex<HashMap<i64, VecDeque<FetchOutcome>>>,
    redeem_script: Mutex<HashMap<i64, VecDeque<RedeemOutcome>>>,
    fetch_calls: Mutex<Vec<i64>>,
    redeem_calls: Mutex<Vec<(i64, String)>>,
    gated: bool,
    permits: Mutex<HashMap<i64, Arc<Semaphore>>>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self {
            fetch_script: Mutex::new(HashMap::new()),
            redeem_script: Mutex::new(HashMap::new()),
            fetch_calls: Mutex::new(Vec::new()),
            redeem_calls: Mutex::new(Vec::new()),
            gated: false,
            permits: Mutex::new(HashMap::new()),
        }
    }

    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Self::new()
        }
    }

    /// Deterministic fallback snapshot for an unscripted fid.
    pub fn default_snapshot(fid: i64) -> PlayerSnapshot {
        PlayerSnapshot {
            fid,
            nickname: Some(format!("Player{fid}")),
            stove_lv: 10,
            kid: 1,
            avatar_image: None,
        }
    }

    pub fn script_fetch(&self, fid: i64, outcomes: Vec<FetchOutcome>) {
        self.fetch_script.lock().insert(fid, outcomes.into());
    }

    pub fn script_redeem(&self, fid: i64, outcomes: Vec<RedeemOutcome>) {
        self.redeem_script.lock().insert(fid, outcomes.into());
    }

    /// Issue one call permit for `fid` (gated mode only).
    pub fn allow(&self, fid: i64) {
        self.permit(fid).add_permits(1);
    }

    fn permit(&self, fid: i64) -> Arc<Semaphore> {
        self.permits
            .lock()
            .entry(fid)
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    pub fn fetch_calls(&self) -> Vec<i64> {
        self.fetch_calls.lock().clone()
    }

    pub fn fetch_count(&self, fid: i64) -> usize {
        self.fetch_calls.lock().iter().filter(|&&f| f == fid).count()
    }

    pub fn redeem_calls(&self) -> Vec<(i64, String)> {
        self.redeem_calls.lock().clone()
    }

    async fn wait_permit(&self, fid: i64) {
        if self.gated {
            let semaphore = self.permit(fid);
            let permit = semaphore.acquire().await.expect("semaphore closed");
            permit.forget();
        }
    }
}

#[async_trait]
impl PlayerApi for ScriptedApi {
    async fn fetch(&self, fid: i64) -> Result<FetchOutcome, ApiError> {
        self.wait_permit(fid).await;
        self.fetch_calls.lock().push(fid);
        let scripted = self
            .fetch_script
            .lock()
            .get_mut(&fid)
            .and_then(|queue| queue.pop_front());
        Ok(scripted.unwrap_or_else(|| FetchOutcome::Snapshot(Self::default_snapshot(fid))))
    }

    async fn redeem(&self, fid: i64, code: &str) -> Result<RedeemOutcome, ApiError> {
        self.wait_permit(fid).await;
        self.redeem_calls.lock().push((fid, code.to_string()));
        let scripted = self
            .redeem_script
            .lock()
            .get_mut(&fid)
            .and_then(|queue| queue.pop_front());
        Ok(scripted.unwrap_or(RedeemOutcome::Success))
    }
}

/// Captures every message handed to the sink.
pub struct CaptureSink {
    pub sent: Mutex<Vec<(String, ChannelMessage)>>,
    pub fail_next: Mutex<bool>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_next: Mutex::new(false),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl NotificationSink for CaptureSink {
    async fn send(&self, channel_id: &str, message: &ChannelMessage) -> Result<(), SinkError> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(SinkError::Rejected { status: 500 });
        }
        self.sent
            .lock()
            .push((channel_id.to_string(), message.clone()));
        Ok(())
    }
}

/// Completes instantly and records the order processes were dispatched in.
pub struct RecordingHandler {
    pub order: Arc<Mutex<Vec<i64>>>,
}

impl RecordingHandler {
    pub fn new(order: Arc<Mutex<Vec<i64>>>) -> Self {
        Self { order }
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    async fn run(
        &self,
        process: &Process,
        _yield_check: &YieldCheck,
    ) -> Result<RunOutcome, ProcessError> {
        self.order.lock().push(process.id);
        Ok(RunOutcome::Completed)
    }
}

/// Poll until `condition` holds, with a wall-clock timeout. Handler tasks
/// run on virtual time, so a few real milliseconds per round trip is all
/// the waiting this ever does.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
