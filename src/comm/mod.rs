pub mod collector;
pub mod ingress;
pub mod retry;

pub use collector::TcpCollector;
pub use retry::RetryPolicy;
