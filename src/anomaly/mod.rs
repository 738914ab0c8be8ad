pub mod detector;
pub mod window;

pub use detector::AnomalyDetector;
