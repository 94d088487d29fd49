use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Runtime configuration, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_port: u16,
    /// Minimum spacing between consecutive game-API calls.
    pub per_call_delay: Duration,
    /// Back-off after the remote API reports a rate limit.
    pub rate_limit_delay: Duration,
    /// How often the queue wake worker re-runs admission.
    pub wake_interval: Duration,
    /// Spacing between consecutive notification sends.
    pub notify_delay: Duration,
    pub max_embeds_per_message: usize,
    pub max_description_length: usize,
    /// Consecutive non-existence strikes before deletion is considered.
    pub exist_threshold: i64,
    pub game_api_base: String,
    pub game_api_secret: String,
    /// Notification relay endpoint; unset means notifications are logged only.
    pub webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://frostwarden.db".to_string()),
            server_port: env_or("SERVER_PORT", 8080),
            per_call_delay: Duration::from_millis(env_or("PER_CALL_DELAY_MS", 2000)),
            rate_limit_delay: Duration::from_millis(env_or("RATE_LIMIT_DELAY_MS", 60_000)),
            wake_interval: Duration::from_millis(env_or("WAKE_INTERVAL_MS", 5000)),
            notify_delay: Duration::from_millis(env_or("NOTIFY_DELAY_MS", 2000)),
            max_embeds_per_message: env_or("MAX_EMBEDS_PER_MESSAGE", 10),
            max_description_length: env_or("MAX_DESCRIPTION_LENGTH", 4096),
            exist_threshold: env_or("EXIST_THRESHOLD", 3),
            game_api_base: std::env::var("GAME_API_BASE")
                .unwrap_or_else(|_| "https://gift-api.example-game.com/api".to_string()),
            game_api_secret: std::env::var("GAME_API_SECRET").unwrap_or_default(),
            webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
