use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, FetchOutcome, PlayerApi, PlayerSnapshot, RedeemOutcome};

// Remote error codes. The player endpoint reports a missing role and the
// gift-code endpoint reports per-code outcomes through `err_code`.
const ERR_ROLE_NOT_EXIST: i64 = 40004;
const ERR_ALREADY_CLAIMED: i64 = 40008;
const ERR_SAME_TYPE_CLAIMED: i64 = 40011;
const ERR_CODE_EXPIRED: i64 = 40007;
const ERR_CODE_NOT_FOUND: i64 = 40014;
const ERR_CAPTCHA_REQUIRED: i64 = 40101;

/// Signed HTTP client for the game's roster and gift-code API.
pub struct GameApiClient {
    http: Client,
    base: String,
    secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    err_code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Transport-level outcome of one API round trip. HTTP 429 is surfaced
/// before body parsing because the limiter does not return an envelope.
enum CallResult {
    Envelope(ApiEnvelope),
    RateLimited,
}

impl GameApiClient {
    pub fn new(base: impl Into<String>, secret: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .user_agent("frostwarden/1.0")
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            base: base.into(),
            secret: secret.into(),
        }
    }

    /// Sign request parameters: the form fields sorted by key, joined as a
    /// query string, with the shared secret appended, MD5-hexed.
    fn sign(&self, params: &[(&str, String)]) -> String {
        let mut sorted: Vec<_> = params.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        let joined = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let mut hasher = Md5::new();
        hasher.update(joined.as_bytes());
        hasher.update(self.secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn call(&self, path: &str, params: &[(&str, String)]) -> Result<CallResult, ApiError> {
        let url = format!("{}/{}", self.base.trim_end_matches('/'), path);
        let sign = self.sign(params);

        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("sign", sign));

        debug!(url = %url, "Game API call");

        let resp = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| ApiError::Network {
                endpoint: url.clone(),
                source: e,
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Ok(CallResult::RateLimited);
        }
        if !status.is_success() {
            return Err(ApiError::Protocol {
                endpoint: url,
                reason: format!("unexpected status {status}"),
            });
        }

        let envelope = resp.json::<ApiEnvelope>().await.map_err(|e| ApiError::Protocol {
            endpoint: url,
            reason: e.to_string(),
        })?;
        Ok(CallResult::Envelope(envelope))
    }

    fn base_params(&self, fid: i64) -> Vec<(&'static str, String)> {
        vec![
            ("fid", fid.to_string()),
            ("time", chrono::Utc::now().timestamp_millis().to_string()),
        ]
    }
}

#[async_trait]
impl PlayerApi for GameApiClient {
    async fn fetch(&self, fid: i64) -> Result<FetchOutcome, ApiError> {
        let params = self.base_params(fid);
        let envelope = match self.call("player", &params).await? {
            CallResult::RateLimited => return Ok(FetchOutcome::RateLimited),
            CallResult::Envelope(envelope) => envelope,
        };

        if envelope.err_code == Some(ERR_ROLE_NOT_EXIST) {
            return Ok(FetchOutcome::RoleNotExist);
        }
        if envelope.code != 0 {
            return Err(ApiError::Protocol {
                endpoint: "player".to_string(),
                reason: format!(
                    "code {} err_code {:?} msg {:?}",
                    envelope.code, envelope.err_code, envelope.msg
                ),
            });
        }

        let data = envelope.data.ok_or_else(|| ApiError::Protocol {
            endpoint: "player".to_string(),
            reason: "missing data payload".to_string(),
        })?;
        let snapshot: PlayerSnapshot =
            serde_json::from_value(data).map_err(|e| ApiError::Protocol {
                endpoint: "player".to_string(),
                reason: format!("malformed player payload: {e}"),
            })?;

        Ok(FetchOutcome::Snapshot(snapshot))
    }

    async fn redeem(&self, fid: i64, code: &str) -> Result<RedeemOutcome, ApiError> {
        let mut params = self.base_params(fid);
        params.push(("cdk", code.to_string()));
        let envelope = match self.call("gift_code", &params).await? {
            CallResult::RateLimited => return Ok(RedeemOutcome::RateLimited),
            CallResult::Envelope(envelope) => envelope,
        };

        match envelope.err_code {
            None if envelope.code == 0 => Ok(RedeemOutcome::Success),
            Some(ERR_ALREADY_CLAIMED) => Ok(RedeemOutcome::AlreadyClaimed),
            Some(ERR_SAME_TYPE_CLAIMED) => Ok(RedeemOutcome::SameTypeClaimed),
            Some(ERR_CODE_EXPIRED) => Ok(RedeemOutcome::Expired),
            Some(ERR_CODE_NOT_FOUND) => Ok(RedeemOutcome::NotFound),
            Some(ERR_CAPTCHA_REQUIRED) => Ok(RedeemOutcome::CaptchaRequired),
            other => Err(ApiError::Protocol {
                endpoint: "gift_code".to_string(),
                reason: format!("code {} err_code {:?}", envelope.code, other),
            }),
        }
    }
}
