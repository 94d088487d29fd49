use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::models::{
    Alliance, AdminLog, FieldChange, ChangeField, Player, Process, ProcessStatus, SystemLog,
};

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub read_connections: u32,
    pub acquire_timeout: Duration,
    pub busy_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://frostwarden.db".to_string()),
            read_connections: 4,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Two-pool SQLite handle: every write goes through a single-connection
/// pool, so concurrent writers serialize on acquisition; readers get their
/// own pool and, under WAL, never block the writer beyond a commit.
#[derive(Clone)]
pub struct Db {
    read: SqlitePool,
    write: SqlitePool,
}

impl Db {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .context("invalid DATABASE_URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options.clone())
            .await
            .context("failed to open database for writing")?;

        let read = SqlitePoolOptions::new()
            .max_connections(config.read_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .context("failed to open database for reading")?;

        let db = Self { read, write };
        init_schema(&db).await?;
        Ok(db)
    }

    /// Fresh shared-cache in-memory database, one per call. Used by tests.
    pub async fn connect_in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "sqlite:file:frostwarden_mem_{}?mode=memory&cache=shared",
            NEXT.fetch_add(1, Ordering::Relaxed)
        );

        let options = SqliteConnectOptions::from_str(&name)?.foreign_keys(true);

        // Keep one connection alive at all times or the database vanishes.
        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options.clone())
            .await?;
        let read = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { read, write };
        init_schema(&db).await?;
        Ok(db)
    }

    pub fn reader(&self) -> &SqlitePool {
        &self.read
    }

    pub fn writer(&self) -> &SqlitePool {
        &self.write
    }
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS processes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        target INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        priority INTEGER NOT NULL,
        details TEXT NOT NULL,
        progress TEXT NOT NULL,
        resume_after INTEGER,
        preempted_by INTEGER,
        created_by TEXT NOT NULL DEFAULT 'system',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_processes_status_priority
        ON processes (status, priority)",
    "CREATE INDEX IF NOT EXISTS idx_processes_resume_after
        ON processes (resume_after)",
    "CREATE INDEX IF NOT EXISTS idx_processes_preempted_by
        ON processes (preempted_by)",
    "CREATE TABLE IF NOT EXISTS alliances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        priority INTEGER NOT NULL UNIQUE,
        name TEXT NOT NULL,
        channel_id TEXT,
        interval TEXT,
        auto_redeem INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS players (
        fid INTEGER PRIMARY KEY,
        alliance_id INTEGER NOT NULL,
        nickname TEXT NOT NULL DEFAULT 'Unknown',
        furnace_level INTEGER NOT NULL DEFAULT 0,
        state INTEGER NOT NULL DEFAULT 0,
        exist INTEGER NOT NULL DEFAULT 0,
        is_rich INTEGER NOT NULL DEFAULT 0,
        vip_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_players_alliance ON players (alliance_id)",
    "CREATE TABLE IF NOT EXISTS furnace_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fid INTEGER NOT NULL,
        old_level INTEGER NOT NULL,
        new_level INTEGER NOT NULL,
        changed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS nickname_changes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        fid INTEGER NOT NULL,
        old_nickname TEXT NOT NULL,
        new_nickname TEXT NOT NULL,
        changed_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS giftcode_usage (
        fid INTEGER NOT NULL,
        gift_code TEXT NOT NULL,
        status TEXT NOT NULL,
        redeemed_at TEXT NOT NULL,
        PRIMARY KEY (fid, gift_code)
    )",
    "CREATE INDEX IF NOT EXISTS idx_giftcode_usage_code ON giftcode_usage (gift_code)",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS system_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        level TEXT NOT NULL,
        source TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS admin_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
];

/// Create all tables and indexes. Idempotent; runs at every startup.
pub async fn init_schema(db: &Db) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(db.writer())
            .await
            .context("failed to initialize schema")?;
    }
    Ok(())
}

// =============================================================================
// Process operations
// =============================================================================

#[allow(clippy::too_many_arguments)]
pub async fn insert_process(
    db: &Db,
    action: crate::models::ProcessAction,
    target: i64,
    priority: i64,
    details_json: &str,
    progress_json: &str,
    created_by: &str,
) -> Result<i64> {
    let now = Utc::now();
    let result = sqlx::query(
        "INSERT INTO processes \
           (action, target, status, priority, details, progress, created_by, created_at, updated_at) \
         VALUES (?, ?, 'queued', ?, ?, ?, ?, ?, ?)",
    )
    .bind(action)
    .bind(target)
    .bind(priority)
    .bind(details_json)
    .bind(progress_json)
    .bind(created_by)
    .bind(now)
    .bind(now)
    .execute(db.writer())
    .await
    .context("failed to insert process")?;

    Ok(result.last_insert_rowid())
}

pub async fn get_process(db: &Db, id: i64) -> Result<Option<Process>> {
    let process = sqlx::query_as::<_, Process>("SELECT * FROM processes WHERE id = ?")
        .bind(id)
        .fetch_optional(db.reader())
        .await
        .context("failed to fetch process")?;
    Ok(process)
}

pub async fn get_processes_by_status(db: &Db, status: ProcessStatus) -> Result<Vec<Process>> {
    let processes = sqlx::query_as::<_, Process>(
        "SELECT * FROM processes WHERE status = ? ORDER BY priority ASC, created_at ASC, id ASC",
    )
    .bind(status)
    .fetch_all(db.reader())
    .await
    .context("failed to fetch processes by status")?;
    Ok(processes)
}

pub async fn get_active_process(db: &Db) -> Result<Option<Process>> {
    let process = sqlx::query_as::<_, Process>("SELECT * FROM processes WHERE status = 'active'")
        .fetch_optional(db.reader())
        .await
        .context("failed to fetch active process")?;
    Ok(process)
}

/// The single best admission candidate: highest priority first, FIFO inside
/// a priority, ids as the final tiebreaker. Rows still inside their
/// `resume_after` back-off window are not eligible.
pub async fn get_next_queued_process(db: &Db, now_ms: i64) -> Result<Option<Process>> {
    let process = sqlx::query_as::<_, Process>(
        "SELECT * FROM processes \
         WHERE status = 'queued' AND (resume_after IS NULL OR resume_after <= ?) \
         ORDER BY priority ASC, created_at ASC, id ASC \
         LIMIT 1",
    )
    .bind(now_ms)
    .fetch_optional(db.reader())
    .await
    .context("failed to fetch next queued process")?;
    Ok(process)
}

pub async fn has_higher_priority_queued(db: &Db, current_priority: i64, now_ms: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processes \
         WHERE status = 'queued' AND priority < ? \
           AND (resume_after IS NULL OR resume_after <= ?)",
    )
    .bind(current_priority)
    .bind(now_ms)
    .fetch_one(db.reader())
    .await
    .context("failed to count higher-priority queued processes")?;
    Ok(count > 0)
}

/// Promote a queued process to active. Guarded so a second active row can
/// never appear; returns false when the guard rejected the write.
pub async fn activate_process(db: &Db, id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE processes \
         SET status = 'active', preempted_by = NULL, resume_after = NULL, updated_at = ? \
         WHERE id = ? AND status = 'queued' \
           AND NOT EXISTS (SELECT 1 FROM processes WHERE status = 'active')",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(db.writer())
    .await
    .context("failed to activate process")?;
    Ok(result.rows_affected() == 1)
}

/// Terminal transition. Only non-terminal rows can be finished; completed
/// and failed processes are never resurrected.
pub async fn finish_process(db: &Db, id: i64, status: ProcessStatus) -> Result<bool> {
    let now = Utc::now();
    let result = sqlx::query(
        "UPDATE processes SET status = ?, completed_at = ?, updated_at = ? \
         WHERE id = ? AND status IN ('queued', 'active')",
    )
    .bind(status)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(db.writer())
    .await
    .context("failed to finish process")?;
    Ok(result.rows_affected() == 1)
}

pub async fn update_process_progress(db: &Db, id: i64, progress_json: &str) -> Result<()> {
    sqlx::query("UPDATE processes SET progress = ?, updated_at = ? WHERE id = ?")
        .bind(progress_json)
        .bind(Utc::now())
        .bind(id)
        .execute(db.writer())
        .await
        .context("failed to update process progress")?;
    Ok(())
}

pub async fn set_process_resume_after(db: &Db, id: i64, resume_after: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE processes SET resume_after = ?, updated_at = ? WHERE id = ?")
        .bind(resume_after)
        .bind(Utc::now())
        .bind(id)
        .execute(db.writer())
        .await
        .context("failed to set resume_after")?;
    Ok(())
}

/// Atomic eviction triple: back to queued, record the preemptor, clear any
/// back-off so the victim is re-admitted on priority alone.
pub async fn set_process_preemption(db: &Db, id: i64, preempted_by: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE processes \
         SET status = 'queued', preempted_by = ?, resume_after = NULL, updated_at = ? \
         WHERE id = ? AND status = 'active'",
    )
    .bind(preempted_by)
    .bind(Utc::now())
    .bind(id)
    .execute(db.writer())
    .await
    .context("failed to record preemption")?;
    Ok(result.rows_affected() == 1)
}

/// Crash-recovery sweep, run once at boot. A row still `active` with no
/// preemptor was running when the host died; requeue it so admission picks
/// it up again. Rows queued with `preempted_by` set are already correct.
pub async fn recover_interrupted_processes(db: &Db) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE processes SET status = 'queued', updated_at = ? \
         WHERE status = 'active' AND preempted_by IS NULL",
    )
    .bind(Utc::now())
    .execute(db.writer())
    .await
    .context("failed to sweep interrupted processes")?;
    Ok(result.rows_affected())
}

/// The queued-or-active auto-refresh process for an alliance, if one exists.
/// Storage is the source of truth for the single-flight guarantee at boot.
pub async fn find_refresh_in_flight(db: &Db, alliance_id: i64) -> Result<Option<Process>> {
    let process = sqlx::query_as::<_, Process>(
        "SELECT * FROM processes \
         WHERE action = 'auto_refresh' AND target = ? AND status IN ('queued', 'active') \
         LIMIT 1",
    )
    .bind(alliance_id)
    .fetch_optional(db.reader())
    .await
    .context("failed to look up in-flight refresh")?;
    Ok(process)
}

/// Collect change entries that earlier refresh passes of this alliance
/// detected but never delivered, clearing them from their terminal rows so
/// a restore happens at most once. The caller merges them into the running
/// pass; delivery stays at-least-once.
pub async fn take_unsent_changes(
    db: &Db,
    alliance_id: i64,
) -> Result<Vec<crate::models::ChangeEntry>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        "SELECT id, progress FROM processes \
         WHERE target = ? AND action IN ('refresh', 'auto_refresh') \
           AND status IN ('completed', 'failed') \
           AND progress LIKE '%detectedChanges%' \
         ORDER BY id ASC",
    )
    .bind(alliance_id)
    .fetch_all(db.reader())
    .await
    .context("failed to scan for unsent changes")?;

    let mut entries = Vec::new();
    for (id, raw) in rows {
        let Ok(mut progress) = serde_json::from_str::<crate::models::ProcessProgress>(&raw) else {
            continue;
        };
        if progress.detected_changes.is_empty() {
            continue;
        }
        entries.append(&mut progress.detected_changes);
        update_process_progress(db, id, &progress.to_json()).await?;
    }
    Ok(entries)
}

// =============================================================================
// Alliance operations
// =============================================================================

pub async fn get_alliance(db: &Db, id: i64) -> Result<Option<Alliance>> {
    let alliance = sqlx::query_as::<_, Alliance>("SELECT * FROM alliances WHERE id = ?")
        .bind(id)
        .fetch_optional(db.reader())
        .await
        .context("failed to fetch alliance")?;
    Ok(alliance)
}

pub async fn get_alliances_with_interval(db: &Db) -> Result<Vec<Alliance>> {
    let alliances = sqlx::query_as::<_, Alliance>(
        "SELECT * FROM alliances WHERE interval IS NOT NULL AND interval != '' ORDER BY priority ASC",
    )
    .fetch_all(db.reader())
    .await
    .context("failed to fetch alliances with intervals")?;
    Ok(alliances)
}

pub async fn insert_alliance(
    db: &Db,
    priority: i64,
    name: &str,
    channel_id: Option<&str>,
    interval: Option<&str>,
    auto_redeem: bool,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO alliances (priority, name, channel_id, interval, auto_redeem) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(priority)
    .bind(name)
    .bind(channel_id)
    .bind(interval)
    .bind(auto_redeem)
    .execute(db.writer())
    .await
    .context("failed to insert alliance")?;
    Ok(result.last_insert_rowid())
}

pub async fn update_alliance_interval(db: &Db, id: i64, interval: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE alliances SET interval = ? WHERE id = ?")
        .bind(interval)
        .bind(id)
        .execute(db.writer())
        .await
        .context("failed to update alliance interval")?;
    Ok(())
}

pub async fn delete_alliance(db: &Db, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM alliances WHERE id = ?")
        .bind(id)
        .execute(db.writer())
        .await
        .context("failed to delete alliance")?;
    Ok(())
}

/// Bulk player counts, one round trip for the whole id set.
pub async fn get_player_counts_by_alliance_ids(db: &Db, ids: &[i64]) -> Result<Vec<(i64, i64)>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT alliance_id, COUNT(*) FROM players \
         WHERE alliance_id IN ({placeholders}) GROUP BY alliance_id",
    );
    let mut query = sqlx::query_as::<_, (i64, i64)>(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query
        .fetch_all(db.reader())
        .await
        .context("failed to count players by alliance")?;
    Ok(rows)
}

// =============================================================================
// Player operations
// =============================================================================

pub async fn get_player(db: &Db, fid: i64) -> Result<Option<Player>> {
    let player = sqlx::query_as::<_, Player>("SELECT * FROM players WHERE fid = ?")
        .bind(fid)
        .fetch_optional(db.reader())
        .await
        .context("failed to fetch player")?;
    Ok(player)
}

pub async fn get_players_by_alliance(db: &Db, alliance_id: i64) -> Result<Vec<Player>> {
    let players =
        sqlx::query_as::<_, Player>("SELECT * FROM players WHERE alliance_id = ? ORDER BY fid ASC")
            .bind(alliance_id)
            .fetch_all(db.reader())
            .await
            .context("failed to fetch alliance players")?;
    Ok(players)
}

/// Insert a new roster member. Returns false when the fid already exists.
pub async fn insert_player(db: &Db, player: &Player) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO players (fid, alliance_id, nickname, furnace_level, state, exist, is_rich, vip_count) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (fid) DO NOTHING",
    )
    .bind(player.fid)
    .bind(player.alliance_id)
    .bind(&player.nickname)
    .bind(player.furnace_level)
    .bind(player.state)
    .bind(player.exist)
    .bind(player.is_rich)
    .bind(player.vip_count)
    .execute(db.writer())
    .await
    .context("failed to insert player")?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_player(db: &Db, fid: i64) -> Result<()> {
    sqlx::query("DELETE FROM players WHERE fid = ?")
        .bind(fid)
        .execute(db.writer())
        .await
        .context("failed to delete player")?;
    Ok(())
}

pub async fn set_player_exist(db: &Db, fid: i64, strikes: i64) -> Result<()> {
    sqlx::query("UPDATE players SET exist = ? WHERE fid = ?")
        .bind(strikes)
        .bind(fid)
        .execute(db.writer())
        .await
        .context("failed to update player exist counter")?;
    Ok(())
}

/// Apply a refresh outcome in one logical transaction: update the stored
/// player, reset the non-existence counter, and append the per-field
/// history rows for every observed change.
pub async fn apply_player_refresh(
    db: &Db,
    fid: i64,
    nickname: &str,
    furnace_level: i64,
    state: i64,
    changes: &[FieldChange],
) -> Result<()> {
    let now = Utc::now();
    let mut tx = db
        .writer()
        .begin()
        .await
        .context("failed to open refresh transaction")?;

    sqlx::query(
        "UPDATE players SET nickname = ?, furnace_level = ?, state = ?, exist = 0 WHERE fid = ?",
    )
    .bind(nickname)
    .bind(furnace_level)
    .bind(state)
    .bind(fid)
    .execute(&mut *tx)
    .await
    .context("failed to update player from snapshot")?;

    for change in changes {
        match change.field {
            ChangeField::FurnaceLevel => {
                sqlx::query(
                    "INSERT INTO furnace_changes (fid, old_level, new_level, changed_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(fid)
                .bind(change.old.parse::<i64>().unwrap_or(0))
                .bind(change.new.parse::<i64>().unwrap_or(0))
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("failed to append furnace change")?;
            }
            ChangeField::Nickname => {
                sqlx::query(
                    "INSERT INTO nickname_changes (fid, old_nickname, new_nickname, changed_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(fid)
                .bind(&change.old)
                .bind(&change.new)
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("failed to append nickname change")?;
            }
            // State moves are notified but carry no history table.
            ChangeField::State => {}
        }
    }

    tx.commit().await.context("failed to commit refresh")?;
    Ok(())
}

pub async fn get_furnace_changes(db: &Db, fid: i64) -> Result<Vec<(i64, i64)>> {
    let rows = sqlx::query_as::<_, (i64, i64)>(
        "SELECT old_level, new_level FROM furnace_changes WHERE fid = ? ORDER BY id ASC",
    )
    .bind(fid)
    .fetch_all(db.reader())
    .await
    .context("failed to fetch furnace changes")?;
    Ok(rows)
}

pub async fn get_nickname_changes(db: &Db, fid: i64) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query_as::<_, (String, String)>(
        "SELECT old_nickname, new_nickname FROM nickname_changes WHERE fid = ? ORDER BY id ASC",
    )
    .bind(fid)
    .fetch_all(db.reader())
    .await
    .context("failed to fetch nickname changes")?;
    Ok(rows)
}

// =============================================================================
// Gift-code usage
// =============================================================================

pub async fn get_fids_who_redeemed_code(db: &Db, code: &str) -> Result<Vec<i64>> {
    let fids = sqlx::query_scalar::<_, i64>(
        "SELECT fid FROM giftcode_usage WHERE gift_code = ? ORDER BY fid ASC",
    )
    .bind(code)
    .fetch_all(db.reader())
    .await
    .context("failed to fetch redeemed fids")?;
    Ok(fids)
}

/// Of `fids`, the subset that already has a usage row for `code`. One round
/// trip; used to short-circuit redeem passes.
pub async fn check_bulk_usage(db: &Db, code: &str, fids: &[i64]) -> Result<Vec<i64>> {
    if fids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; fids.len()].join(", ");
    let sql = format!(
        "SELECT fid FROM giftcode_usage WHERE gift_code = ? AND fid IN ({placeholders})",
    );
    let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(code);
    for fid in fids {
        query = query.bind(fid);
    }
    let redeemed = query
        .fetch_all(db.reader())
        .await
        .context("failed to bulk-check gift code usage")?;
    Ok(redeemed)
}

pub async fn insert_giftcode_usage(db: &Db, fid: i64, code: &str, status: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO giftcode_usage (fid, gift_code, status, redeemed_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT (fid, gift_code) DO UPDATE SET status = excluded.status",
    )
    .bind(fid)
    .bind(code)
    .bind(status)
    .bind(Utc::now())
    .execute(db.writer())
    .await
    .context("failed to record gift code usage")?;
    Ok(())
}

// =============================================================================
// Settings
// =============================================================================

pub async fn get_setting(db: &Db, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db.reader())
        .await
        .context("failed to fetch setting")?;
    Ok(value)
}

pub async fn set_setting(db: &Db, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?) \
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(db.writer())
    .await
    .context("failed to store setting")?;
    Ok(())
}

// =============================================================================
// System and admin logs
// =============================================================================

pub async fn insert_system_log(db: &Db, level: &str, source: &str, message: &str) -> Result<()> {
    sqlx::query("INSERT INTO system_logs (level, source, message, created_at) VALUES (?, ?, ?, ?)")
        .bind(level)
        .bind(source)
        .bind(message)
        .bind(Utc::now())
        .execute(db.writer())
        .await
        .context("failed to insert system log")?;
    Ok(())
}

pub async fn recent_system_logs(db: &Db, limit: i64) -> Result<Vec<SystemLog>> {
    let logs = sqlx::query_as::<_, SystemLog>(
        "SELECT * FROM system_logs ORDER BY id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(db.reader())
    .await
    .context("failed to fetch system logs")?;
    Ok(logs)
}

pub async fn insert_admin_log(db: &Db, actor: &str, action: &str, detail: &str) -> Result<()> {
    sqlx::query("INSERT INTO admin_logs (actor, action, detail, created_at) VALUES (?, ?, ?, ?)")
        .bind(actor)
        .bind(action)
        .bind(detail)
        .bind(Utc::now())
        .execute(db.writer())
        .await
        .context("failed to insert admin log")?;
    Ok(())
}

pub async fn recent_admin_logs(db: &Db, limit: i64) -> Result<Vec<AdminLog>> {
    let logs =
        sqlx::query_as::<_, AdminLog>("SELECT * FROM admin_logs ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(db.reader())
            .await
            .context("failed to fetch admin logs")?;
    Ok(logs)
}
