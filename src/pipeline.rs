/// Per-reading processing: battery gating, anomaly detection and accumulation
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::aggregation::SummaryAccumulator;
use crate::anomaly::AnomalyDetector;
use crate::battery::BatteryStateManager;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::{Anomaly, RawReading, Reading};

#[derive(Debug, Clone, PartialEq)]
pub enum ReadingOutcome {
    /// Battery below the accept gate; nothing was buffered or detected
    Dropped { drone_id: String, level: f64 },
    Processed {
        drone_id: String,
        anomalies: Vec<Anomaly>,
        motors_shut_down: bool,
    },
}

/// Owns the per-drone detection state and shares battery and batch tables
/// with the aggregation task.
pub struct ReadingPipeline {
    accept_threshold: f64,
    battery: Arc<BatteryStateManager>,
    detector: AnomalyDetector,
    accumulator: Arc<SummaryAccumulator>,
}

impl ReadingPipeline {
    pub fn new(
        config: PipelineConfig,
        battery: Arc<BatteryStateManager>,
        accumulator: Arc<SummaryAccumulator>,
    ) -> Self {
        ReadingPipeline {
            accept_threshold: config.accept_threshold,
            battery,
            detector: AnomalyDetector::new(config),
            accumulator,
        }
    }

    #[cfg(test)]
    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Process one reading synchronously
    pub fn process(&mut self, raw: RawReading) -> Result<ReadingOutcome, PipelineError> {
        let mut reading = Reading::from_raw(raw)?;
        let drone_id = reading.drone_id.clone();

        self.battery.apply_time_drain(&drone_id, reading.timestamp);

        if !self.battery.should_accept(&drone_id) {
            let level = self.battery.level_of(&drone_id);
            warn!(
                "Battery critical for {} ({:.1}%), dropping reading",
                drone_id, level
            );
            return Ok(ReadingOutcome::Dropped { drone_id, level });
        }

        // Motors are cut before the reading is buffered anywhere
        let level = self.battery.drain_on_read(&drone_id);
        let motors_shut_down = level < self.accept_threshold;
        if motors_shut_down {
            warn!(
                "Battery at {:.1}% for {}, shutting down motors",
                level, drone_id
            );
            reading.shut_down_motors();
        }

        let anomalies = self.detector.detect(&reading);
        if anomalies.is_empty() {
            debug!(
                "No anomalies for {} at {} ({} readings in window)",
                drone_id,
                reading.timestamp,
                self.detector.window_len(&drone_id)
            );
        } else {
            let rendered = serde_json::to_string(&anomalies)
                .unwrap_or_else(|_| format!("{:?}", anomalies));
            warn!("Anomalies detected for {}: {}", drone_id, rendered);
        }

        self.accumulator.accumulate(&drone_id, reading);

        Ok(ReadingOutcome::Processed {
            drone_id,
            anomalies,
            motors_shut_down,
        })
    }

    /// Consume readings in arrival order until every sender is gone
    pub async fn run(mut self, mut rx: mpsc::Receiver<RawReading>) {
        info!("Reading pipeline started");
        let (mut processed, mut dropped, mut rejected) = (0u64, 0u64, 0u64);

        while let Some(raw) = rx.recv().await {
            match self.process(raw) {
                Ok(ReadingOutcome::Processed { .. }) => processed += 1,
                Ok(ReadingOutcome::Dropped { .. }) => dropped += 1,
                Err(e) => {
                    error!("Rejected reading: {}", e);
                    rejected += 1;
                }
            }
        }

        info!(
            "Reading pipeline stopped: {} processed, {} dropped, {} rejected",
            processed, dropped, rejected
        );
    }
}
