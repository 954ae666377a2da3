use std::path::{Path, PathBuf};
use std::sync::Arc;

use creator_demographics::{
    config::AppConfig,
    pipeline::Pipeline,
    services::{
        job_source::FileJobSource, metrics::RecorderMetrics, predictor::ModelServerClient,
        sink::JsonLinesSink, storage::ObjectStore, thumbnails::ScraperClient,
    },
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// One-shot run: read a username list, write a JSON-lines report.
#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let run_id = Uuid::new_v4().to_string();

    tracing::info!(run_id = %run_id, "Starting creator demographics run");

    let store = object_store(&config);

    let input = PathBuf::from(&config.input_file);
    if !input.exists() {
        match (&store, &config.input_key) {
            (Some(store), Some(key)) => store
                .download_input(key, &input)
                .await
                .expect("Failed to download input list"),
            _ => panic!("Input file {} not found and no INPUT_KEY configured", input.display()),
        }
    }

    let jobs = FileJobSource::open(&input)
        .await
        .expect("Failed to open input list");

    let thumbnails = ScraperClient::new(
        &config.scraper_api_url,
        &config.scraper_api_token,
        &config.scraper_actor_id,
    )
    .expect("Failed to initialize scraper client");

    let predictor = ModelServerClient::new(&config.predictor_url);
    if let Err(e) = predictor.health_check().await {
        tracing::warn!(error = %e, "Predictor health check failed, continuing");
    }

    let output = config
        .output_file
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("data/output/results_{run_id}.jsonl")));
    let sink = JsonLinesSink::create(&output)
        .await
        .expect("Failed to create report file");

    let pipeline = Pipeline::new(config.pipeline())
        .expect("Invalid pipeline configuration")
        .with_metrics(Arc::new(RecorderMetrics));

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let result = pipeline
        .run(
            jobs,
            Arc::new(thumbnails),
            Arc::new(predictor),
            Arc::new(sink),
            cancel,
        )
        .await;

    // The report holds every emitted verdict even when the run halted.
    if let Some(store) = &store {
        upload_report(store, &run_id, &output).await;
    }

    match result {
        Ok(summary) => {
            tracing::info!(
                run_id = %run_id,
                report = %output.display(),
                submitted = summary.submitted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                abandoned = ?summary.abandoned,
                "Run complete"
            );
        }
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "Run halted");
            std::process::exit(1);
        }
    }
}

fn object_store(config: &AppConfig) -> Option<ObjectStore> {
    let bucket = config.s3_bucket.as_deref()?;
    let store = ObjectStore::new(
        bucket,
        config.s3_endpoint.as_deref().unwrap_or_default(),
        &config.s3_region,
        config.s3_access_key.as_deref().unwrap_or_default(),
        config.s3_secret_key.as_deref().unwrap_or_default(),
    )
    .expect("Failed to initialize object store");
    Some(store)
}

async fn upload_report(store: &ObjectStore, run_id: &str, report: &Path) {
    if let Err(e) = store.upload_report(run_id, report).await {
        tracing::error!(error = %e, "Failed to upload report");
    }
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("Interrupt received, draining in-flight work");
        cancel.cancel();
    }
}
