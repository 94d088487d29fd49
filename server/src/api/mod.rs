//! Game API boundary.
//!
//! Remote signals that the original wire protocol reports through error
//! codes are explicit sum types here; handlers switch on the outcome
//! instead of catching thrown markers.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::GameApiClient;

/// Player state as reported by the remote game API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub fid: i64,
    #[serde(default)]
    pub nickname: Option<String>,
    /// Furnace level.
    #[serde(default)]
    pub stove_lv: i64,
    /// Home state (server) number.
    #[serde(default)]
    pub kid: i64,
    #[serde(default)]
    pub avatar_image: Option<String>,
}

/// Result of a player fetch. `RoleNotExist` and `RateLimited` are data, not
/// errors: the refresh loop records the former and backs off on the latter.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Snapshot(PlayerSnapshot),
    RoleNotExist,
    RateLimited,
}

/// Result of a gift-code redeem call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Success,
    /// This player already claimed the code.
    AlreadyClaimed,
    /// The player claimed another code of the same reward batch.
    SameTypeClaimed,
    /// The code expired; no player can redeem it anymore.
    Expired,
    /// The code does not exist; no player can redeem it.
    NotFound,
    /// The API demanded captcha verification, which this service does not do.
    CaptchaRequired,
    RateLimited,
}

impl RedeemOutcome {
    /// True when the outcome should be recorded as a successful usage row
    /// (the player ends up holding the reward, now or previously).
    pub fn counts_as_redeemed(&self) -> bool {
        matches!(
            self,
            RedeemOutcome::Success | RedeemOutcome::AlreadyClaimed | RedeemOutcome::SameTypeClaimed
        )
    }

    /// True when the code itself is dead and further attempts are pointless.
    pub fn kills_code(&self) -> bool {
        matches!(self, RedeemOutcome::Expired | RedeemOutcome::NotFound)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RedeemOutcome::Success => "success",
            RedeemOutcome::AlreadyClaimed => "already_claimed",
            RedeemOutcome::SameTypeClaimed => "same_type_claimed",
            RedeemOutcome::Expired => "expired",
            RedeemOutcome::NotFound => "not_found",
            RedeemOutcome::CaptchaRequired => "captcha_required",
            RedeemOutcome::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {endpoint} failed: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected response from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },
}

impl ApiError {
    /// Network faults are transient and worth a backed-off retry of the
    /// same unit; protocol faults are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Network { .. })
    }
}

/// The remote game API as the handlers consume it.
#[async_trait]
pub trait PlayerApi: Send + Sync {
    async fn fetch(&self, fid: i64) -> Result<FetchOutcome, ApiError>;
    async fn redeem(&self, fid: i64, code: &str) -> Result<RedeemOutcome, ApiError>;
}
