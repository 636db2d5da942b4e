//! Metrics module
//!
//! Prometheus export of cache statistics and the periodic stats reporter.

mod exporter;
mod reporter;

pub use exporter::MetricsExporter;
pub use reporter::StatsReporter;
