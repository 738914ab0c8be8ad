/// Periodic rollup of accumulated readings into collector summaries
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use time::OffsetDateTime;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::aggregation::accumulator::{summarize_batch, SummaryAccumulator};
use crate::battery::BatteryStateManager;
use crate::comm::collector::CollectorSink;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::models::Summary;
use crate::utils::format_summary_timestamp;

/// What happened to one drone's batch during a cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// Summary handed to the collector; `level` is the battery after the send drain
    Sent { level: f64 },
    /// Battery below the send gate, summary dropped
    BatteryLow { level: f64 },
    /// Batch failed integrity checks, cycle skipped for this drone
    Invalid(PipelineError),
    /// Collector rejected or could not be reached, summary lost
    SinkFailed(String),
}

#[derive(Debug)]
pub struct DroneCycleReport {
    pub drone_id: String,
    pub returned_to_base: bool,
    pub outcome: CycleOutcome,
}

/// Per-pass totals for the pass log line
#[derive(Debug, Default, PartialEq)]
pub struct CycleTally {
    pub sent: usize,
    pub battery_low: usize,
    pub invalid: usize,
    pub sink_failed: usize,
    pub returned_to_base: usize,
    pub lowest_level: Option<f64>,
    pub problems: Vec<String>,
}

impl CycleTally {
    pub fn from_reports(reports: &[DroneCycleReport]) -> Self {
        let mut tally = CycleTally::default();
        for report in reports {
            if report.returned_to_base {
                tally.returned_to_base += 1;
            }
            match &report.outcome {
                CycleOutcome::Sent { level } => {
                    tally.sent += 1;
                    tally.observe_level(*level);
                }
                CycleOutcome::BatteryLow { level } => {
                    tally.battery_low += 1;
                    tally.observe_level(*level);
                }
                CycleOutcome::Invalid(e) => {
                    tally.invalid += 1;
                    tally.problems.push(format!("{}: {}", report.drone_id, e));
                }
                CycleOutcome::SinkFailed(reason) => {
                    tally.sink_failed += 1;
                    tally.problems.push(format!("{}: {}", report.drone_id, reason));
                }
            }
        }
        tally
    }

    fn observe_level(&mut self, level: f64) {
        self.lowest_level = Some(self.lowest_level.map_or(level, |lowest| lowest.min(level)));
    }
}

pub struct AggregationScheduler<S> {
    period: Duration,
    send_threshold: f64,
    battery: Arc<BatteryStateManager>,
    accumulator: Arc<SummaryAccumulator>,
    sink: S,
}

impl<S: CollectorSink> AggregationScheduler<S> {
    pub fn new(
        config: &PipelineConfig,
        battery: Arc<BatteryStateManager>,
        accumulator: Arc<SummaryAccumulator>,
        sink: S,
    ) -> Self {
        AggregationScheduler {
            period: config.aggregation_period,
            send_threshold: config.send_threshold,
            battery,
            accumulator,
            sink,
        }
    }

    /// Run aggregation passes forever, one per period
    ///
    /// A pass is awaited to completion before the next tick is taken, and
    /// ticks missed while a slow pass was running are skipped.
    pub async fn run(self) {
        info!(
            "Aggregation running every {:.1}s",
            self.period.as_secs_f64()
        );

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let reports = self.run_cycle(OffsetDateTime::now_utc()).await;
            if reports.is_empty() {
                debug!("Aggregation pass found no pending readings");
                continue;
            }

            let tally = CycleTally::from_reports(&reports);
            info!(
                "Aggregation pass: {} sent, {} battery low, {} invalid, {} failed, {} returned to base, lowest battery {}",
                tally.sent,
                tally.battery_low,
                tally.invalid,
                tally.sink_failed,
                tally.returned_to_base,
                tally
                    .lowest_level
                    .map_or_else(|| "n/a".to_string(), |level| format!("{:.1}%", level))
            );
            if !tally.problems.is_empty() {
                warn!("Aggregation problems: {}", tally.problems.join("; "));
            }
        }
    }

    /// One aggregation pass over every drone with pending readings
    ///
    /// All batches are taken (and thereby cleared) up front. Summaries that
    /// pass the battery gate are delivered concurrently; a failure for one
    /// drone does not affect the others.
    pub async fn run_cycle(&self, now: OffsetDateTime) -> Vec<DroneCycleReport> {
        let timestamp = format_summary_timestamp(&now);
        let mut reports = Vec::new();
        let mut outgoing = Vec::new();

        for (drone_id, batch) in self.accumulator.take_batches() {
            let averages = match summarize_batch(&drone_id, &batch) {
                Ok(averages) => averages,
                Err(e) => {
                    error!("Skipping aggregation for {}: {}", drone_id, e);
                    reports.push(DroneCycleReport {
                        drone_id,
                        returned_to_base: false,
                        outcome: CycleOutcome::Invalid(e),
                    });
                    continue;
                }
            };

            let check = self.battery.check_return_to_base(&drone_id);
            if check.triggered {
                warn!(
                    "*** Return-to-base triggered for {} at {:.1}% ***",
                    drone_id, check.level
                );
            }

            if check.level < self.send_threshold {
                warn!(
                    "Battery low for {} ({:.1}%), skipping summary",
                    drone_id, check.level
                );
                reports.push(DroneCycleReport {
                    drone_id,
                    returned_to_base: check.triggered,
                    outcome: CycleOutcome::BatteryLow { level: check.level },
                });
                continue;
            }

            let level = self
                .battery
                .drain_on_send(&drone_id, averages.mean_motor_power());

            debug!(
                "Summary for {} based on {} samples",
                drone_id, averages.samples
            );
            let summary = Summary {
                drone_id,
                avg_temperature: averages.temperature,
                avg_pressure: averages.pressure,
                avg_altitude: averages.altitude,
                avg_motor_energies: averages.motor_energies,
                timestamp: timestamp.clone(),
            };
            outgoing.push((summary, check.triggered, level));
        }

        let results = join_all(
            outgoing
                .iter()
                .map(|(summary, _, _)| self.sink.send(summary)),
        )
        .await;

        for ((summary, returned_to_base, level), result) in outgoing.into_iter().zip(results) {
            let outcome = match result {
                Ok(()) => {
                    info!(
                        "Sent summary for {}: temp={:.2}, pressure={:.2}, altitude={:.2}, motors={:?}; battery {:.1}%",
                        summary.drone_id,
                        summary.avg_temperature,
                        summary.avg_pressure,
                        summary.avg_altitude,
                        summary.avg_motor_energies,
                        level
                    );
                    CycleOutcome::Sent { level }
                }
                Err(e) => {
                    error!("Failed to send summary for {}: {}", summary.drone_id, e);
                    CycleOutcome::SinkFailed(e.to_string())
                }
            };
            reports.push(DroneCycleReport {
                drone_id: summary.drone_id,
                returned_to_base,
                outcome,
            });
        }

        reports.sort_by(|a, b| a.drone_id.cmp(&b.drone_id));
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::error::SinkError;
    use crate::models::Reading;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Summary>>,
        fail_for: Option<String>,
    }

    #[async_trait]
    impl CollectorSink for RecordingSink {
        async fn send(&self, summary: &Summary) -> Result<(), SinkError> {
            if self.fail_for.as_deref() == Some(summary.drone_id.as_str()) {
                return Err(SinkError::RetriesExhausted { attempts: 1 });
            }
            self.sent.lock().unwrap().push(summary.clone());
            Ok(())
        }
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    fn reading(drone_id: &str, motors: Vec<f64>) -> Reading {
        Reading {
            drone_id: drone_id.into(),
            timestamp: at(0),
            temperature: Some(20.0),
            pressure: Some(1013.0),
            altitude: Some(100.0),
            motor_energies: motors,
        }
    }

    struct Fixture {
        battery: Arc<BatteryStateManager>,
        accumulator: Arc<SummaryAccumulator>,
        sink: Arc<RecordingSink>,
        scheduler: AggregationScheduler<Arc<RecordingSink>>,
    }

    fn fixture(sink: RecordingSink) -> Fixture {
        let config = PipelineConfig::default();
        let battery = Arc::new(BatteryStateManager::new(&config));
        let accumulator = Arc::new(SummaryAccumulator::new());
        let sink = Arc::new(sink);
        let scheduler = AggregationScheduler::new(
            &config,
            Arc::clone(&battery),
            Arc::clone(&accumulator),
            Arc::clone(&sink),
        );
        Fixture {
            battery,
            accumulator,
            sink,
            scheduler,
        }
    }

    fn drain_to(battery: &BatteryStateManager, drone_id: &str, elapsed_secs: i64) {
        battery.apply_time_drain(drone_id, at(0));
        battery.apply_time_drain(drone_id, at(elapsed_secs));
    }

    #[tokio::test]
    async fn sends_per_motor_averages() {
        let f = fixture(RecordingSink::default());
        for motors in [
            vec![10.0, 20.0, 30.0, 40.0],
            vec![20.0, 20.0, 20.0, 20.0],
            vec![30.0, 20.0, 10.0, 0.0],
        ] {
            f.accumulator.accumulate("d1", reading("d1", motors));
        }

        let reports = f.scheduler.run_cycle(at(1_714_564_800)).await;
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, CycleOutcome::Sent { .. }));

        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].drone_id, "d1");
        assert_eq!(sent[0].avg_motor_energies, vec![20.0, 20.0, 20.0, 20.0]);
        assert_eq!(sent[0].avg_temperature, 20.0);
        assert_eq!(sent[0].timestamp, "2024-05-01T12:00:00Z");

        // 0.2 base + 20 * 0.001 motor
        assert!((f.battery.level_of("d1") - 99.78).abs() < 1e-9);
        assert_eq!(f.accumulator.pending("d1"), 0);
    }

    #[tokio::test]
    async fn quiet_drones_are_not_summarized() {
        let f = fixture(RecordingSink::default());
        f.accumulator.accumulate("d1", reading("d1", vec![]));
        assert_eq!(f.scheduler.run_cycle(at(0)).await.len(), 1);
        assert!(f.scheduler.run_cycle(at(2)).await.is_empty());
        assert_eq!(f.sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn low_battery_skips_send_but_clears_batch() {
        let f = fixture(RecordingSink::default());
        // 100 - 85 = 15%
        drain_to(&f.battery, "d1", 850);
        f.accumulator.accumulate("d1", reading("d1", vec![50.0]));

        let reports = f.scheduler.run_cycle(at(900)).await;
        assert!(reports[0].returned_to_base);
        assert!(matches!(
            reports[0].outcome,
            CycleOutcome::BatteryLow { level } if (level - 15.0).abs() < 1e-9
        ));
        assert!(f.sink.sent.lock().unwrap().is_empty());
        assert_eq!(f.accumulator.pending("d1"), 0);
        // No send drain was applied
        assert!((f.battery.level_of("d1") - 15.0).abs() < 1e-9);

        f.accumulator.accumulate("d1", reading("d1", vec![50.0]));
        let reports = f.scheduler.run_cycle(at(902)).await;
        assert!(!reports[0].returned_to_base);
    }

    #[tokio::test]
    async fn invalid_batch_is_skipped_without_touching_battery() {
        let f = fixture(RecordingSink::default());
        drain_to(&f.battery, "d1", 850);
        f.accumulator.accumulate("d1", reading("d1", vec![1.0, 2.0]));
        f.accumulator.accumulate("d1", reading("d1", vec![1.0]));
        f.accumulator.accumulate("d2", reading("d2", vec![1.0]));

        let reports = f.scheduler.run_cycle(at(900)).await;
        assert_eq!(reports.len(), 2);
        assert!(matches!(
            reports[0].outcome,
            CycleOutcome::Invalid(PipelineError::MotorCountMismatch { .. })
        ));
        assert!(matches!(reports[1].outcome, CycleOutcome::Sent { .. }));
        assert_eq!(f.accumulator.pending("d1"), 0);
        // The return-to-base latch was not consumed by the skipped cycle
        assert!(f.battery.check_return_to_base("d1").triggered);
    }

    #[tokio::test]
    async fn sink_failure_is_isolated_per_drone() {
        let f = fixture(RecordingSink {
            fail_for: Some("d1".to_string()),
            ..Default::default()
        });
        f.accumulator.accumulate("d1", reading("d1", vec![10.0]));
        f.accumulator.accumulate("d2", reading("d2", vec![10.0]));

        let reports = f.scheduler.run_cycle(at(0)).await;
        assert!(matches!(
            &reports[0].outcome,
            CycleOutcome::SinkFailed(reason) if reason.contains("1 attempts")
        ));
        assert!(matches!(reports[1].outcome, CycleOutcome::Sent { .. }));

        let tally = CycleTally::from_reports(&reports);
        assert_eq!(tally.sent, 1);
        assert_eq!(tally.sink_failed, 1);
        assert_eq!(tally.problems.len(), 1);
        assert!(tally.problems[0].starts_with("d1: "));

        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].drone_id, "d2");
        assert_eq!(f.accumulator.pending("d1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_emits_once_per_period() {
        let f = fixture(RecordingSink::default());
        f.accumulator.accumulate("d1", reading("d1", vec![]));
        let accumulator = Arc::clone(&f.accumulator);
        let sink = Arc::clone(&f.sink);
        let handle = tokio::spawn(f.scheduler.run());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 1);

        accumulator.accumulate("d1", reading("d1", vec![]));
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(sink.sent.lock().unwrap().len(), 2);

        handle.abort();
    }

    #[tokio::test]
    async fn tally_counts_outcomes_and_lowest_level() {
        let f = fixture(RecordingSink::default());
        drain_to(&f.battery, "low", 850);
        f.accumulator.accumulate("low", reading("low", vec![10.0]));
        f.accumulator.accumulate("bad", reading("bad", vec![1.0, 2.0]));
        f.accumulator.accumulate("bad", reading("bad", vec![1.0]));
        f.accumulator.accumulate("ok", reading("ok", vec![]));

        let tally = CycleTally::from_reports(&f.scheduler.run_cycle(at(900)).await);
        assert_eq!(tally.sent, 1);
        assert_eq!(tally.battery_low, 1);
        assert_eq!(tally.invalid, 1);
        assert_eq!(tally.sink_failed, 0);
        assert_eq!(tally.returned_to_base, 1);
        assert!((tally.lowest_level.unwrap() - 15.0).abs() < 1e-9);
        assert_eq!(tally.problems.len(), 1);
        assert!(tally.problems[0].starts_with("bad: "));

        assert_eq!(CycleTally::from_reports(&[]), CycleTally::default());
    }

    /// Takes five seconds per summary and records how many sends overlap
    #[derive(Default)]
    struct SlowSink {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl CollectorSink for SlowSink {
        async fn send(&self, _summary: &Summary) -> Result<(), SinkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pass_delays_next_pass_instead_of_overlapping() {
        let config = PipelineConfig::default();
        let battery = Arc::new(BatteryStateManager::new(&config));
        let accumulator = Arc::new(SummaryAccumulator::new());
        let sink = Arc::new(SlowSink::default());
        let scheduler = AggregationScheduler::new(
            &config,
            battery,
            Arc::clone(&accumulator),
            Arc::clone(&sink),
        );
        let handle = tokio::spawn(scheduler.run());

        // ~21s of steady readings against a 2s period and a 5s send
        for _ in 0..42 {
            accumulator.accumulate("d1", reading("d1", vec![10.0]));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        handle.abort();

        assert_eq!(sink.max_in_flight.load(Ordering::SeqCst), 1);
        // Overlapping passes would have sent ten times
        let calls = sink.calls.load(Ordering::SeqCst);
        assert!((3..=5).contains(&calls), "{} sends", calls);
    }
}
