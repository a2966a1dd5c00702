//! Observability: health probes and Prometheus metrics.

pub mod health;
pub mod metrics;
