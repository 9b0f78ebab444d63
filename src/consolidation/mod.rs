pub mod aggregator;
pub mod hierarchy;
pub mod multi_employer;
