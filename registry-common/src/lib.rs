pub mod consul;
pub mod metrics;
pub mod registry;
