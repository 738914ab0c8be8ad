use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::error::PipelineError;
use crate::utils::{derive_drone_id, parse_timestamp};

/// A reading as framed by ingress, before drone id derivation and timestamp parsing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawReading {
    #[serde(default)]
    pub drone_id: Option<String>,
    #[serde(default)]
    pub sensor_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(default)]
    pub motor_energies: Option<Vec<f64>>,
}

/// Non-string values become `None` so a bad timestamp costs only the timestamp
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    })
}

/// One sensor sample attributed to a drone
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub drone_id: String,
    pub timestamp: OffsetDateTime,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub altitude: Option<f64>,
    pub motor_energies: Vec<f64>,
}

impl Reading {
    pub fn from_raw(raw: RawReading) -> Result<Self, PipelineError> {
        let drone_id = derive_drone_id(raw.drone_id.as_deref(), raw.sensor_id.as_deref())
            .ok_or(PipelineError::MissingDroneId)?;

        Ok(Reading {
            drone_id,
            timestamp: parse_timestamp(raw.timestamp.as_deref().unwrap_or_default()),
            temperature: raw.temperature,
            pressure: raw.pressure,
            altitude: raw.altitude,
            motor_energies: raw.motor_energies.unwrap_or_default(),
        })
    }

    /// Motor cut-off: every motor reports zero energy
    pub fn shut_down_motors(&mut self) {
        self.motor_energies.iter_mut().for_each(|m| *m = 0.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    Temperature,
    Pressure,
    Altitude,
    Motor(usize),
    TemperatureDiscrepancy,
    AltitudeDiscrepancy,
}

impl AnomalyKind {
    pub fn is_discrepancy(&self) -> bool {
        matches!(
            self,
            AnomalyKind::TemperatureDiscrepancy | AnomalyKind::AltitudeDiscrepancy
        )
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyKind::Temperature => write!(f, "temperature"),
            AnomalyKind::Pressure => write!(f, "pressure"),
            AnomalyKind::Altitude => write!(f, "altitude"),
            AnomalyKind::Motor(index) => write!(f, "motor_{}", index),
            AnomalyKind::TemperatureDiscrepancy => write!(f, "temperature_discrepancy"),
            AnomalyKind::AltitudeDiscrepancy => write!(f, "altitude_discrepancy"),
        }
    }
}

/// A flagged condition. For threshold anomalies `value` is the offending
/// reading, for discrepancies it is the max-min spread over the window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub value: f64,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, value: f64) -> Self {
        Anomaly { kind, value }
    }
}

impl Serialize for Anomaly {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", &self.kind.to_string())?;
        let value_key = if self.kind.is_discrepancy() {
            "range"
        } else {
            "value"
        };
        map.serialize_entry(value_key, &self.value)?;
        map.end()
    }
}

/// Averages computed over one drone's batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAverages {
    pub temperature: f64,
    pub pressure: f64,
    pub altitude: f64,
    pub motor_energies: Vec<f64>,
    pub samples: usize,
}

impl BatchAverages {
    /// Mean of the per-motor averages, zero when the drone reports no motors
    pub fn mean_motor_power(&self) -> f64 {
        if self.motor_energies.is_empty() {
            return 0.0;
        }
        self.motor_energies.iter().sum::<f64>() / self.motor_energies.len() as f64
    }
}

/// Record forwarded to the collector once per drone per aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub drone_id: String,
    pub avg_temperature: f64,
    pub avg_pressure: f64,
    pub avg_altitude: f64,
    pub avg_motor_energies: Vec<f64>,
    pub timestamp: String,
}
