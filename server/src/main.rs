use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use frostwarden_server::{
    api::GameApiClient,
    budget::ApiBudget,
    clock::{Clock, TokioClock},
    config::Config,
    db::{Db, DbConfig},
    handlers::{AddPlayerHandler, RedeemHandler, RefreshEngine},
    health,
    models::ProcessAction,
    notify::{NotificationSink, TracingSink, WebhookSink},
    scheduler::{ActionHandler, ProcessExecutor, ProcessRegistry, QueueManager},
    settings::Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Default to warn in production, debug in development
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }

        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting Frostwarden server");

    let config = Config::from_env();
    tracing::info!(
        per_call_delay_ms = config.per_call_delay.as_millis() as u64,
        rate_limit_delay_ms = config.rate_limit_delay.as_millis() as u64,
        exist_threshold = config.exist_threshold,
        "Configuration loaded"
    );

    // Initialize database
    let db = Db::connect(&DbConfig {
        database_url: config.database_url.clone(),
        ..DbConfig::default()
    })
    .await?;
    tracing::info!("Database initialized");

    // Scheduler components
    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let registry = ProcessRegistry::new(db.clone());
    let executor = Arc::new(ProcessExecutor::new(db.clone()));
    let queue = QueueManager::new(db.clone(), registry.clone(), executor.clone(), clock.clone());
    let settings = Settings::new(db.clone());
    let budget = Arc::new(ApiBudget::new(clock.clone(), config.per_call_delay));

    let api = Arc::new(GameApiClient::new(
        config.game_api_base.clone(),
        config.game_api_secret.clone(),
    ));
    let sink: Arc<dyn NotificationSink> = match &config.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone())),
        None => Arc::new(TracingSink),
    };

    // Requeue whatever was running when the previous host died, before any
    // admission can happen.
    let recovered = registry.recover().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Requeued interrupted processes");
    }

    let engine = RefreshEngine::new(
        db.clone(),
        registry.clone(),
        queue.clone(),
        api.clone(),
        budget.clone(),
        clock.clone(),
        sink,
        settings,
        config.clone(),
    );

    let mut handlers: HashMap<ProcessAction, Arc<dyn ActionHandler>> = HashMap::new();
    handlers.insert(ProcessAction::AutoRefresh, engine.clone());
    handlers.insert(ProcessAction::Refresh, engine.clone());
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
            api,
            budget,
            clock.clone(),
            config.clone(),
        )),
    );
    executor.register_handlers(handlers);

    // Arm per-alliance timers; recovered processes keep their marker and
    // re-arm on completion.
    engine.bootstrap().await?;
    tracing::info!("Refresh engine bootstrapped");

    let shutdown = CancellationToken::new();

    // Wake worker: re-runs admission so recovered rows and elapsed
    // rate-limit back-offs get picked up.
    let wake_queue = queue.clone();
    let wake_shutdown = shutdown.clone();
    let wake_interval = config.wake_interval;
    tokio::spawn(async move {
        wake_queue.run_wake_worker(wake_interval, wake_shutdown).await;
    });

    // Kick one admission for anything already queued.
    queue.admit().await;

    // Admin & health surface
    let app_state = health::AppState {
        db: db.clone(),
        queue: queue.clone(),
        settings: Settings::new(db.clone()),
    };
    let app = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/admin/queue", get(health::queue_stats))
        .route("/admin/logs/system", get(health::system_logs))
        .route("/admin/logs/admin", get(health::admin_logs))
        .route("/admin/settings/auto_delete", post(health::set_auto_delete))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
            serve_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    Ok(())
}
