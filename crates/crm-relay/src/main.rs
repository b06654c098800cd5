//! CRM relay binary entry point.
//!
//! Usage: crm-relay [--redis-url <url>] [--crm-api-url <url>] [--log-file]
//!
//! All settings are read from `RELAY_*` environment variables; flags given
//! on the command line take precedence.

use batch_delivery_engine::BatchDeliveryEngine;
use clap::Parser;
use crm_relay::{CrmApiSink, Relay, RelayConfig, RelayResult};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// CRM relay: Redis stream to CRM API with batching, retry and dead-lettering.
#[derive(Parser, Debug)]
#[command(name = "crm-relay")]
#[command(about = "Relays CRM events from a Redis stream to the CRM HTTP API")]
struct Args {
    /// Redis connection URL.
    #[arg(long)]
    redis_url: Option<String>,

    /// CRM API endpoint.
    #[arg(long)]
    crm_api_url: Option<String>,

    /// JSON file with the batch section (max_batch_size, flush_interval_ms, ...).
    #[arg(long)]
    batch_config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write JSON logs to ~/.unbound/logs/crm-relay.jsonl
    #[arg(long)]
    log_file: bool,
}

#[tokio::main]
async fn main() -> RelayResult<()> {
    let args = Args::parse();

    let log_path = if args.log_file {
        observability::default_log_path("crm-relay")
    } else {
        None
    };
    observability::init_with_config(observability::LogConfig {
        service_name: "crm-relay".into(),
        default_level: args.log_level.clone(),
        log_path,
        also_stderr: true,
        ..Default::default()
    })?;

    info!("CRM relay starting...");

    let mut config = RelayConfig::from_env()?;
    if let Some(redis_url) = args.redis_url {
        config.redis_url = redis_url;
    }
    if let Some(crm_api_url) = args.crm_api_url {
        config.crm_api_url = crm_api_url;
    }
    if let Some(path) = args.batch_config {
        config.batch = crm_relay::config::load_batch_file(&path)?;
    }
    config.validate()?;

    info!(
        redis_url = %config.redis_url,
        stream = %config.stream,
        dead_letter_stream = %config.dead_letter_stream,
        consumer = %config.consumer_name,
        crm_api_url = %config.crm_api_url,
        max_batch_size = config.batch.max_batch_size,
        flush_interval_ms = config.batch.flush_interval_ms,
        max_retries = config.batch.max_retries,
        claim_min_idle_ms = u64::try_from(config.claim_min_idle.as_millis()).unwrap_or(u64::MAX),
        claim_interval_ms = u64::try_from(config.claim_interval.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded"
    );

    let sink = CrmApiSink::new(
        config.crm_api_url.clone(),
        config.crm_api_token.clone(),
        config.http_timeout,
    )?;
    let engine = Arc::new(BatchDeliveryEngine::<Value>::spawn(
        config.batch.clone(),
        Arc::new(sink),
    )?);

    let mut relay = Relay::new(config, engine.clone()).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    let result = relay.run(shutdown).await;
    if let Err(e) = &result {
        error!(error = %e, "Relay exited with error");
    }

    info!("Draining delivery engine...");
    let report = engine.stop().await?;
    info!(
        confirmed = report.confirmed,
        dead_lettered = report.dead_lettered,
        released = report.released,
        "CRM relay stopped"
    );

    result
}
