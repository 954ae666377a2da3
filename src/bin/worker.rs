use axum::{routing::get, routing::post, Router};
use creator_demographics::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries::PgVerdictSink},
    pipeline::{Pipeline, Predictor, ThumbnailSource},
    routes,
    services::{
        metrics::{describe_metrics, RecorderMetrics},
        predictor::ModelServerClient,
        queue::{QueueJobSource, UsernameQueue},
        sink::AckingSink,
        thumbnails::ScraperClient,
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

/// Pause after a halted round before polling again.
const HALT_BACKOFF: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting creator demographics worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    describe_metrics();

    let database_url = config.database_url.as_deref().expect("DATABASE_URL is required");
    let redis_url = config.redis_url.as_deref().expect("REDIS_URL is required");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(database_url)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Connecting to Redis username queue");
    let queue = UsernameQueue::new(redis_url).expect("Failed to initialize username queue");
    let recovered = queue
        .requeue_unacknowledged()
        .await
        .expect("Failed to recover unacknowledged usernames");
    if recovered > 0 {
        tracing::warn!(recovered, "Re-queued usernames left by a previous worker");
    }

    let thumbnails: Arc<dyn ThumbnailSource> = Arc::new(
        ScraperClient::new(
            &config.scraper_api_url,
            &config.scraper_api_token,
            &config.scraper_actor_id,
        )
        .expect("Failed to initialize scraper client"),
    );
    let predictor: Arc<dyn Predictor> = Arc::new(ModelServerClient::new(&config.predictor_url));

    let pipeline = Pipeline::new(config.pipeline())
        .expect("Invalid pipeline configuration")
        .with_metrics(Arc::new(RecorderMetrics));

    let state = AppState::new(db_pool.clone(), queue.clone());
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/jobs", post(routes::jobs::submit_jobs))
        .route("/api/v1/verdicts/{username}", get(routes::jobs::get_verdict))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(Arc::new(prometheus_handle)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Worker API listening on {}", config.bind_addr);

    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move { server_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing current round");
            signal_cancel.cancel();
        }
    });

    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    tracing::info!("Worker ready, starting queue processing loop");

    while !cancel.is_cancelled() {
        let depth = match queue.queue_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                tracing::error!(error = %e, "Queue unavailable, will retry");
                idle(&cancel, poll_interval).await;
                continue;
            }
        };
        metrics::gauge!("demographics_queue_depth").set(depth as f64);
        if depth == 0 {
            tracing::trace!("No usernames queued, sleeping");
            idle(&cancel, poll_interval).await;
            continue;
        }

        tracing::info!(queued = depth, "Starting pipeline round");
        let sink = AckingSink::new(PgVerdictSink::new(db_pool.clone()), queue.clone());
        let result = pipeline
            .run(
                QueueJobSource::new(queue.clone()),
                thumbnails.clone(),
                predictor.clone(),
                Arc::new(sink),
                cancel.child_token(),
            )
            .await;

        let halted = match result {
            Ok(summary) => {
                tracing::info!(
                    submitted = summary.submitted,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    abandoned = summary.abandoned.len(),
                    "Pipeline round complete"
                );
                false
            }
            Err(e) => {
                tracing::error!(error = %e, "Pipeline round halted");
                true
            }
        };

        // Anything still unacknowledged was abandoned by this round.
        match queue.requeue_unacknowledged().await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(requeued = n, "Re-queued unfinished usernames"),
            Err(e) => tracing::error!(error = %e, "Failed to re-queue unfinished usernames"),
        }

        if halted {
            idle(&cancel, HALT_BACKOFF).await;
        }
    }

    if let Err(e) = server.await {
        tracing::error!(error = %e, "HTTP server task failed");
    }
    tracing::info!("Worker stopped");
}

async fn idle(cancel: &CancellationToken, period: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(period) => {}
    }
}
