pub mod accumulator;
pub mod scheduler;

pub use accumulator::SummaryAccumulator;
pub use scheduler::AggregationScheduler;
