//! Meshplane control plane: adapter reconciliation, event fan-in, load tests.

pub mod aggregator;
pub mod cli;
pub mod load_test;
pub mod metrics;
pub mod pool;
pub mod reconcile;
pub mod results;
pub mod router;
