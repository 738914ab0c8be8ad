/// Error types for the reading pipeline, the collector boundary and configuration
use thiserror::Error;

/// Errors raised while processing readings or rolling up a batch
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Neither an explicit drone id nor a usable sensor id was present
    #[error("reading has no drone_id and no usable sensor_id")]
    MissingDroneId,

    /// A field required for the summary averages is absent
    #[error("drone {drone_id}: reading in batch is missing {field}")]
    MissingField {
        drone_id: String,
        field: &'static str,
    },

    /// Readings in one batch report different motor counts
    #[error("drone {drone_id}: expected {expected} motors, found a reading with {actual}")]
    MotorCountMismatch {
        drone_id: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised while delivering a summary to the collector
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("invalid collector address: {0}")]
    InvalidAddress(String),

    #[error("collector I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode summary: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("collector unreachable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

/// Errors raised while loading configuration from the environment
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("invalid range for {key}: expected 'min,max' with min <= max")]
    InvalidRange { key: String },
}
