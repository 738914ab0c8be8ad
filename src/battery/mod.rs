pub mod manager;

pub use manager::BatteryStateManager;
