/// Threshold and cross-sensor discrepancy detection
use std::collections::HashMap;

use time::OffsetDateTime;

use crate::anomaly::window::SlidingWindow;
use crate::config::PipelineConfig;
use crate::models::{Anomaly, AnomalyKind, Reading};
use crate::utils::spread;

/// Flag every present field that lies outside its safe range
///
/// Missing fields are skipped. Each out-of-range motor is reported under
/// its own index.
pub fn threshold_anomalies(reading: &Reading, config: &PipelineConfig) -> Vec<Anomaly> {
    let scalars = [
        (AnomalyKind::Temperature, reading.temperature, config.temperature_range),
        (AnomalyKind::Pressure, reading.pressure, config.pressure_range),
        (AnomalyKind::Altitude, reading.altitude, config.altitude_range),
    ];

    let scalar_anomalies = scalars
        .into_iter()
        .filter_map(|(kind, value, range)| value.map(|v| (kind, v, range)))
        .filter(|(_, value, range)| !range.contains(*value))
        .map(|(kind, value, _)| Anomaly::new(kind, value));

    let motor_anomalies = reading
        .motor_energies
        .iter()
        .enumerate()
        .filter(|(_, energy)| !config.motor_range.contains(**energy))
        .map(|(index, energy)| Anomaly::new(AnomalyKind::Motor(index), *energy));

    scalar_anomalies.chain(motor_anomalies).collect()
}

/// Owns the sliding windows of every drone.
///
/// Windows live in an arena indexed through the drone id, so a drone's
/// buffer is allocated once and reused for the life of the detector. Only
/// the reading-processing task touches it.
#[derive(Debug)]
pub struct AnomalyDetector {
    config: PipelineConfig,
    index: HashMap<String, usize>,
    windows: Vec<SlidingWindow>,
}

impl AnomalyDetector {
    pub fn new(config: PipelineConfig) -> Self {
        AnomalyDetector {
            config,
            index: HashMap::new(),
            windows: Vec::new(),
        }
    }

    fn window_mut(&mut self, drone_id: &str) -> &mut SlidingWindow {
        let slot = match self.index.get(drone_id) {
            Some(slot) => *slot,
            None => {
                self.windows.push(SlidingWindow::default());
                let slot = self.windows.len() - 1;
                self.index.insert(drone_id.to_string(), slot);
                slot
            }
        };
        &mut self.windows[slot]
    }

    pub fn window_len(&self, drone_id: &str) -> usize {
        self.index
            .get(drone_id)
            .map_or(0, |slot| self.windows[*slot].len())
    }

    pub fn threshold_anomalies(&self, reading: &Reading) -> Vec<Anomaly> {
        threshold_anomalies(reading, &self.config)
    }

    /// Buffer the reading, then compare temperature and altitude spreads
    /// across the window once it holds enough entries
    pub fn discrepancy_anomalies(
        &mut self,
        drone_id: &str,
        reading: &Reading,
        ts: OffsetDateTime,
    ) -> Vec<Anomaly> {
        let horizon = self.config.window_horizon;
        let min_readings = self.config.min_window_readings;
        let temperature_limit = self.config.temperature_spread_limit;
        let altitude_limit = self.config.altitude_spread_limit;

        let window = self.window_mut(drone_id);
        window.insert(ts, reading.clone(), horizon);

        let mut anomalies = Vec::new();
        if window.len() < min_readings {
            return anomalies;
        }

        if let Some(range) = spread(window.readings().filter_map(|r| r.temperature)) {
            if range > temperature_limit {
                anomalies.push(Anomaly::new(AnomalyKind::TemperatureDiscrepancy, range));
            }
        }
        if let Some(range) = spread(window.readings().filter_map(|r| r.altitude)) {
            if range > altitude_limit {
                anomalies.push(Anomaly::new(AnomalyKind::AltitudeDiscrepancy, range));
            }
        }
        anomalies
    }

    /// Threshold anomalies first, then discrepancies
    pub fn detect(&mut self, reading: &Reading) -> Vec<Anomaly> {
        let mut anomalies = self.threshold_anomalies(reading);
        anomalies.extend(self.discrepancy_anomalies(
            &reading.drone_id,
            reading,
            reading.timestamp,
        ));
        anomalies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn reading(ms: i64) -> Reading {
        Reading {
            drone_id: "d1".into(),
            timestamp: OffsetDateTime::UNIX_EPOCH + Duration::milliseconds(ms),
            temperature: Some(20.0),
            pressure: Some(1013.0),
            altitude: Some(100.0),
            motor_energies: vec![10.0, 20.0, 30.0, 40.0],
        }
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(PipelineConfig::default())
    }

    #[test]
    fn in_range_reading_has_no_threshold_anomalies() {
        let mut r = reading(0);
        r.temperature = Some(60.0);
        r.pressure = Some(300.0);
        r.altitude = Some(0.0);
        r.motor_energies = vec![0.0, 100.0];
        assert!(threshold_anomalies(&r, &PipelineConfig::default()).is_empty());
    }

    #[test]
    fn each_out_of_range_field_is_reported_once() {
        let mut r = reading(0);
        r.temperature = Some(-10.5);
        r.pressure = Some(1100.1);
        r.altitude = Some(501.0);
        r.motor_energies = vec![50.0, -1.0, 100.0, 140.0];
        let anomalies = threshold_anomalies(&r, &PipelineConfig::default());
        assert_eq!(
            anomalies,
            vec![
                Anomaly::new(AnomalyKind::Temperature, -10.5),
                Anomaly::new(AnomalyKind::Pressure, 1100.1),
                Anomaly::new(AnomalyKind::Altitude, 501.0),
                Anomaly::new(AnomalyKind::Motor(1), -1.0),
                Anomaly::new(AnomalyKind::Motor(3), 140.0),
            ]
        );
    }

    #[test]
    fn missing_fields_are_not_anomalies() {
        let mut r = reading(0);
        r.temperature = None;
        r.pressure = None;
        r.altitude = None;
        r.motor_energies.clear();
        assert!(threshold_anomalies(&r, &PipelineConfig::default()).is_empty());
    }

    #[test]
    fn no_discrepancy_below_minimum_window() {
        let mut detector = detector();
        for (i, temp) in [0.0, 40.0, -5.0].into_iter().enumerate() {
            let mut r = reading(i as i64 * 100);
            r.temperature = Some(temp);
            assert!(detector.detect(&r).is_empty());
        }
        assert_eq!(detector.window_len("d1"), 3);
    }

    #[test]
    fn temperature_spread_limit_is_strict() {
        let mut detector = detector();
        for (i, temp) in [20.0, 22.0, 25.0, 21.0].into_iter().enumerate() {
            let mut r = reading(i as i64 * 100);
            r.temperature = Some(temp);
            assert!(detector.detect(&r).is_empty());
        }

        let mut r = reading(400);
        r.temperature = Some(25.01);
        let anomalies = detector.detect(&r);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::TemperatureDiscrepancy);
        assert!((anomalies[0].value - 5.01).abs() < 1e-9);
    }

    #[test]
    fn altitude_spread_limit_is_strict() {
        let mut detector = detector();
        for (i, alt) in [100.0, 100.5, 101.0, 100.2].into_iter().enumerate() {
            let mut r = reading(i as i64 * 100);
            r.altitude = Some(alt);
            assert!(detector.detect(&r).is_empty());
        }

        let mut r = reading(400);
        r.altitude = Some(99.5);
        let anomalies = detector.detect(&r);
        assert_eq!(
            anomalies,
            vec![Anomaly::new(AnomalyKind::AltitudeDiscrepancy, 1.5)]
        );
    }

    #[test]
    fn spread_ignores_readings_missing_the_field() {
        let mut detector = detector();
        for i in 0..5 {
            let mut r = reading(i * 100);
            r.temperature = if i % 2 == 0 { None } else { Some(20.0) };
            assert!(detector.detect(&r).is_empty());
        }
    }

    #[test]
    fn expired_readings_leave_the_window() {
        let mut detector = detector();
        for (ms, alt) in [(0, 0.0), (100, 5.0), (200, 5.0)] {
            let mut r = reading(ms);
            r.altitude = Some(alt);
            detector.detect(&r);
        }
        // Three seconds later the spiky readings have expired
        let mut anomalies = Vec::new();
        for ms in [3200, 3300, 3400, 3500] {
            anomalies.extend(detector.detect(&reading(ms)));
        }
        assert!(anomalies.is_empty());
        assert_eq!(detector.window_len("d1"), 4);
    }

    #[test]
    fn threshold_anomalies_come_before_discrepancies() {
        let mut detector = detector();
        for (i, alt) in [0.0, 0.5, 0.4].into_iter().enumerate() {
            let mut r = reading(i as i64 * 100);
            r.altitude = Some(alt);
            detector.detect(&r);
        }
        let mut r = reading(300);
        r.altitude = Some(-3.0);
        let anomalies = detector.detect(&r);
        assert_eq!(anomalies[0], Anomaly::new(AnomalyKind::Altitude, -3.0));
        assert_eq!(anomalies[1].kind, AnomalyKind::AltitudeDiscrepancy);
    }

    #[test]
    fn windows_are_per_drone() {
        let mut detector = detector();
        for i in 0..3 {
            detector.detect(&reading(i * 100));
        }
        let mut other = reading(300);
        other.drone_id = "d2".into();
        other.altitude = Some(400.0);
        assert!(detector.detect(&other).is_empty());
        assert_eq!(detector.window_len("d1"), 3);
        assert_eq!(detector.window_len("d2"), 1);
    }
}
