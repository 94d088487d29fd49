//! AddPlayer and RedeemGiftCode handler tests.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use frostwarden_server::api::{FetchOutcome, PlayerSnapshot, RedeemOutcome};
use frostwarden_server::budget::ApiBudget;
use frostwarden_server::clock::{Clock, ManualClock};
use frostwarden_server::db::{self, Db};
use frostwarden_server::handlers::{AddPlayerHandler, RedeemHandler};
use frostwarden_server::models::{Player, ProcessAction, ProcessStatus};
use frostwarden_server::scheduler::{ActionHandler, ProcessExecutor, ProcessRegistry, QueueManager};

use common::{test_config, wait_until, ScriptedApi};

struct World {
    db: Db,
    registry: ProcessRegistry,
    queue: Arc<QueueManager>,
    api: Arc<ScriptedApi>,
}

async fn world() -> World {
    let db = Db::connect_in_memory().await.unwrap();
    let clock = Arc::new(ManualClock::with_park_threshold(
        Utc::now(),
        Duration::from_secs(300),
    )) as Arc<dyn Clock>;
    let registry = ProcessRegistry::new(db.clone());
    let executor = Arc::new(ProcessExecutor::new(db.clone()));
    let queue = QueueManager::new(db.clone(), registry.clone(), executor.clone(), clock.clone());
    let api = Arc::new(ScriptedApi::new());
    let config = test_config();
    let budget = Arc::new(ApiBudget::new(clock.clone(), config.per_call_delay));

    let mut handlers: HashMap<ProcessAction, Arc<dyn ActionHandler>> = HashMap::new();
    handlers.insert(
        ProcessAction::AddPlayer,
        Arc::new(AddPlayerHandler::new(
            db.clone(),
            registry.clone(),
            api.clone(),
            budget.clone(),
            clock.clone(),
            config.clone(),
        )),
    );
    handlers.insert(
        ProcessAction::RedeemGiftcode,
        Arc::new(RedeemHandler::new(
            db.clone(),
            registry.clone(),
            api.clone(),
            budget,
            clock,
            config,
        )),
    );
    executor.register_handlers(handlers);

    World {
        db,
        registry,
        queue,
        api,
    }
}

async fn run_to_terminal(world: &World, id: i64) -> ProcessStatus {
    world.queue.submit(id).await;
    wait_until("process reached a terminal state", || {
        let db = world.db.clone();
        async move {
            db::get_process(&db, id)
                .await
                .unwrap()
                .unwrap()
                .status
                .is_terminal()
        }
    })
    .await;
    db::get_process(&world.db, id).await.unwrap().unwrap().status
}

async fn seed_player(db: &Db, fid: i64, alliance_id: i64) {
    db::insert_player(
        db,
        &Player {
            fid,
            alliance_id,
            nickname: format!("Seed{fid}"),
            furnace_level: 1,
            state: 1,
            exist: 0,
            is_rich: false,
            vip_count: 0,
        },
    )
    .await
    .unwrap();
}

// ---------------------------------------------------------------------------
// AddPlayer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_player_sorts_ids_into_done_existing_and_failed() {
    let world = world().await;
    let alliance = db::insert_alliance(&world.db, 1, "NorthWatch", None, None, false)
        .await
        .unwrap();
    seed_player(&world.db, 11, alliance).await;

    world.api.script_fetch(
        12,
        vec![FetchOutcome::Snapshot(PlayerSnapshot {
            fid: 12,
            nickname: Some("Newcomer".to_string()),
            stove_lv: 22,
            kid: 7,
            avatar_image: None,
        })],
    );
    world.api.script_fetch(13, vec![FetchOutcome::RoleNotExist]);

    let id = world
        .registry
        .create(ProcessAction::AddPlayer, alliance, 1, &[11, 12, 13], None, "test")
        .await
        .unwrap();
    let status = run_to_terminal(&world, id).await;
    assert_eq!(status, ProcessStatus::Completed);

    let progress = db::get_process(&world.db, id)
        .await
        .unwrap()
        .unwrap()
        .progress()
        .unwrap();
    assert_eq!(progress.existing, vec![11]);
    assert_eq!(progress.done, vec![12]);
    assert_eq!(progress.failed, vec![13]);

    let added = db::get_player(&world.db, 12).await.unwrap().unwrap();
    assert_eq!(added.nickname, "Newcomer");
    assert_eq!(added.furnace_level, 22);
    assert_eq!(added.state, 7);
    assert_eq!(added.alliance_id, alliance);

    // The id that was already rostered never cost an API call.
    assert_eq!(world.api.fetch_count(11), 0);
}

#[tokio::test]
async fn add_player_defaults_missing_nickname() {
    let world = world().await;
    let alliance = db::insert_alliance(&world.db, 1, "NorthWatch", None, None, false)
        .await
        .unwrap();
    world.api.script_fetch(
        20,
        vec![FetchOutcome::Snapshot(PlayerSnapshot {
            fid: 20,
            nickname: None,
            stove_lv: 1,
            kid: 1,
            avatar_image: None,
        })],
    );

    let id = world
        .registry
        .create(ProcessAction::AddPlayer, alliance, 1, &[20], None, "test")
        .await
        .unwrap();
    run_to_terminal(&world, id).await;

    assert_eq!(
        db::get_player(&world.db, 20).await.unwrap().unwrap().nickname,
        "Unknown"
    );
}

// ---------------------------------------------------------------------------
// RedeemGiftCode
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redeem_skips_prior_usage_and_records_new_usage() {
    let world = world().await;
    let alliance = db::insert_alliance(&world.db, 1, "NorthWatch", None, None, false)
        .await
        .unwrap();
    for fid in [31, 32, 33] {
        seed_player(&world.db, fid, alliance).await;
    }
    // 31 already redeemed this code in an earlier pass.
    db::insert_giftcode_usage(&world.db, 31, "WINTERGIFT", "success")
        .await
        .unwrap();
    world
        .api
        .script_redeem(33, vec![RedeemOutcome::AlreadyClaimed]);

    let id = world
        .registry
        .create(
            ProcessAction::RedeemGiftcode,
            alliance,
            1,
            &[31, 32, 33],
            Some("WINTERGIFT".to_string()),
            "test",
        )
        .await
        .unwrap();
    let status = run_to_terminal(&world, id).await;
    assert_eq!(status, ProcessStatus::Completed);

    let progress = db::get_process(&world.db, id)
        .await
        .unwrap()
        .unwrap()
        .progress()
        .unwrap();
    assert_eq!(progress.done, vec![31, 32, 33]);
    assert!(progress.failed.is_empty());

    // The pre-filtered player cost no API call; the others cost one each.
    let calls = world.api.redeem_calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(fid, code)| *fid != 31 && code == "WINTERGIFT"));

    let redeemed = db::get_fids_who_redeemed_code(&world.db, "WINTERGIFT")
        .await
        .unwrap();
    assert_eq!(redeemed, vec![31, 32, 33]);
}

#[tokio::test]
async fn dead_code_fails_all_remaining_players_without_more_calls() {
    let world = world().await;
    let alliance = db::insert_alliance(&world.db, 1, "NorthWatch", None, None, false)
        .await
        .unwrap();
    for fid in [41, 42, 43] {
        seed_player(&world.db, fid, alliance).await;
    }
    world.api.script_redeem(41, vec![RedeemOutcome::Expired]);

    let id = world
        .registry
        .create(
            ProcessAction::RedeemGiftcode,
            alliance,
            1,
            &[41, 42, 43],
            Some("EXPIREDCODE".to_string()),
            "test",
        )
        .await
        .unwrap();
    let status = run_to_terminal(&world, id).await;
    assert_eq!(status, ProcessStatus::Completed);

    let progress = db::get_process(&world.db, id)
        .await
        .unwrap()
        .unwrap()
        .progress()
        .unwrap();
    assert!(progress.done.is_empty());
    assert_eq!(progress.failed, vec![41, 42, 43]);

    // The first rejection killed the code; nobody else was attempted.
    assert_eq!(world.api.redeem_calls().len(), 1);
    assert!(db::get_fids_who_redeemed_code(&world.db, "EXPIREDCODE")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn redeem_without_a_code_is_a_programming_error() {
    let world = world().await;

    // Bypass creation validation by corrupting the details document the way
    // a migration bug would.
    let id = world
        .registry
        .create(
            ProcessAction::RedeemGiftcode,
            1,
            1,
            &[51],
            Some("TEMP".to_string()),
            "test",
        )
        .await
        .unwrap();
    sqlx::query("UPDATE processes SET details = ? WHERE id = ?")
        .bind(r#"{"player_ids": [51]}"#)
        .bind(id)
        .execute(world.db.writer())
        .await
        .unwrap();

    let status = run_to_terminal(&world, id).await;
    assert_eq!(status, ProcessStatus::Failed);

    let logs = db::recent_system_logs(&world.db, 10).await.unwrap();
    assert!(logs.iter().any(|l| l.message.contains("gift code")));
}
