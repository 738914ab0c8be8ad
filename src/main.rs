mod aggregation;
mod anomaly;
mod battery;
mod comm;
mod config;
mod error;
mod models;
mod pipeline;
mod utils;

use std::sync::Arc;

use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use aggregation::{AggregationScheduler, SummaryAccumulator};
use battery::BatteryStateManager;
use comm::{ingress, TcpCollector};
use config::ServiceConfig;
use pipeline::ReadingPipeline;

async fn run_service(config: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting drone telemetry pipeline");

    let collector = TcpCollector::from_url(&config.collector_url, config.collector_retry.clone())?
        .with_connect_timeout(config.collector_connect_timeout);
    info!("Forwarding summaries to {}", collector.address());
    let listener = TcpListener::bind(&config.listen_addr).await?;

    // Shared between the reading task and the aggregation task
    let battery = Arc::new(BatteryStateManager::new(&config.pipeline));
    let accumulator = Arc::new(SummaryAccumulator::new());

    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let pipeline = ReadingPipeline::new(
        config.pipeline.clone(),
        Arc::clone(&battery),
        Arc::clone(&accumulator),
    );
    let scheduler = AggregationScheduler::new(&config.pipeline, battery, accumulator, collector);

    tokio::spawn(pipeline.run(rx));
    tokio::spawn(scheduler.run());
    info!("Reading pipeline and aggregation tasks started");

    // Serves until the runtime shuts down on Ctrl+C
    ingress::serve(listener, tx).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match ServiceConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                // Keep the sender alive so shutdown is never signalled spuriously
                std::future::pending::<()>().await;
            }
        }
    });

    // Run the service or wait for shutdown signal
    tokio::select! {
        result = run_service(config) => {
            match result {
                Ok(_) => info!("Service stopped"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Program terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
