use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use goodnight_checkin_server::routes::{
    admin_stats, consume_reactions_handler, ensure_user_handler, execute_query, get_checkin,
    health_check, jobs, list_friends, list_requests, pick_random, react, remove_friend,
    resolve_request, rollup_handler, send_request, submit_checkin, submit_message,
    update_profile,
};
use goodnight_checkin_server::{open_database, AppState, Config, Db};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "goodnight_checkin_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Goodnight Check-in Server...");

    // Load configuration
    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e))?;

    tracing::info!(
        "Environment: {}, Server: {}",
        config.environment,
        config.server_address()
    );

    // Open the document store
    let db = open_database(&config.database_path)?;

    // Background reaction consumer
    if config.reaction_consume_interval_secs > 0 {
        spawn_reaction_consumer(db.clone(), config.reaction_consume_interval_secs);
    }

    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(
            config
                .allowed_origins
                .iter()
                .map(|s| s.parse().unwrap())
                .collect::<Vec<_>>(),
        )
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    // Create app state
    let state = AppState::new(db, config.clone());

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/api/user/ensure", post(ensure_user_handler))
        .route("/api/user/profile", post(update_profile))
        .route("/api/checkin", post(submit_checkin).get(get_checkin))
        .route("/api/friend/request", post(send_request))
        .route("/api/friend/resolve", post(resolve_request))
        .route("/api/friend/remove", post(remove_friend))
        .route("/api/friend/list", get(list_friends))
        .route("/api/friend/requests", get(list_requests))
        .route("/api/goodnight", post(submit_message))
        .route("/api/goodnight/random", get(pick_random))
        .route("/api/goodnight/react", post(react))
        .route("/api/query", post(execute_query))
        .route("/api/jobs/reactions", post(consume_reactions_handler))
        .route("/api/jobs/rollup", post(rollup_handler))
        .route("/admin/stats", get(admin_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Drain the reaction queue on a fixed interval
///
/// Each pass is idempotent and bounded, so an overlapping manual run via
/// the job endpoint is harmless.
fn spawn_reaction_consumer(db: Db, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            let db = db.clone();
            let result =
                tokio::task::spawn_blocking(move || jobs::consume_reactions(&db)).await;
            match result {
                Ok(Ok((consumed, messages, failed))) if consumed > 0 => {
                    tracing::info!(
                        "Reaction pass: {} events over {} messages ({} failed)",
                        consumed,
                        messages,
                        failed
                    );
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("Reaction pass failed: {:?}", e),
                Err(e) => tracing::error!("Reaction task join error: {:?}", e),
            }
        }
    });
}
