/// Per-drone batches of accepted readings awaiting the next rollup
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::PipelineError;
use crate::models::{BatchAverages, Reading};
use crate::utils::mean;

/// Batch table written by the reading task and drained by the aggregation task
#[derive(Debug, Default)]
pub struct SummaryAccumulator {
    batches: Mutex<HashMap<String, Vec<Reading>>>,
}

impl SummaryAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Reading>>> {
        self.batches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn accumulate(&self, drone_id: &str, reading: Reading) {
        self.lock()
            .entry(drone_id.to_string())
            .or_default()
            .push(reading);
    }

    #[cfg(test)]
    pub fn pending(&self, drone_id: &str) -> usize {
        self.lock().get(drone_id).map_or(0, Vec::len)
    }

    /// Take every non-empty batch, leaving all batches cleared
    ///
    /// Readings accumulated after this call belong to the next cycle.
    pub fn take_batches(&self) -> Vec<(String, Vec<Reading>)> {
        let mut batches = self.lock();
        let mut taken: Vec<_> = batches
            .iter_mut()
            .filter(|(_, batch)| !batch.is_empty())
            .map(|(drone_id, batch)| (drone_id.clone(), std::mem::take(batch)))
            .collect();
        taken.sort_by(|a, b| a.0.cmp(&b.0));
        taken
    }
}

/// Average a batch of readings
///
/// Temperature, pressure and altitude must be present on every reading and
/// all readings must report as many motors as the first one.
pub fn summarize_batch(drone_id: &str, readings: &[Reading]) -> Result<BatchAverages, PipelineError> {
    let temperature = required_mean(drone_id, readings, "temperature", |r| r.temperature)?;
    let pressure = required_mean(drone_id, readings, "pressure", |r| r.pressure)?;
    let altitude = required_mean(drone_id, readings, "altitude", |r| r.altitude)?;

    let motor_count = readings.first().map_or(0, |r| r.motor_energies.len());
    if let Some(bad) = readings
        .iter()
        .find(|r| r.motor_energies.len() != motor_count)
    {
        return Err(PipelineError::MotorCountMismatch {
            drone_id: drone_id.to_string(),
            expected: motor_count,
            actual: bad.motor_energies.len(),
        });
    }

    let count = readings.len() as f64;
    let motor_energies = (0..motor_count)
        .map(|i| readings.iter().map(|r| r.motor_energies[i]).sum::<f64>() / count)
        .collect();

    Ok(BatchAverages {
        temperature,
        pressure,
        altitude,
        motor_energies,
        samples: readings.len(),
    })
}

fn required_mean(
    drone_id: &str,
    readings: &[Reading],
    field: &'static str,
    get: fn(&Reading) -> Option<f64>,
) -> Result<f64, PipelineError> {
    let missing = || PipelineError::MissingField {
        drone_id: drone_id.to_string(),
        field,
    };
    let values = readings
        .iter()
        .map(|r| get(r).ok_or_else(missing))
        .collect::<Result<Vec<_>, _>>()?;
    mean(values).ok_or_else(missing)
}
