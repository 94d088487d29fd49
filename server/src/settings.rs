use anyhow::Result;
use tracing::warn;

use crate::db::{self, Db};

const AUTO_DELETE_KEY: &str = "auto_delete";

/// Db-backed runtime settings. Values live in the `settings` table so
/// administrative edits survive restarts and take effect without one.
#[derive(Clone)]
pub struct Settings {
    db: Db,
}

impl Settings {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Whether players past the non-existence threshold are deleted
    /// automatically. Defaults to off; read failures also mean off so a
    /// storage hiccup can never trigger a deletion.
    pub async fn auto_delete(&self) -> bool {
        match db::get_setting(&self.db, AUTO_DELETE_KEY).await {
            Ok(value) => matches!(value.as_deref(), Some("true") | Some("1")),
            Err(e) => {
                warn!(error = %e, "Failed to read auto_delete setting");
                false
            }
        }
    }

    pub async fn set_auto_delete(&self, enabled: bool) -> Result<()> {
        db::set_setting(&self.db, AUTO_DELETE_KEY, if enabled { "true" } else { "false" }).await
    }
}
