//! Observability: structured logging setup and metrics collection.
//!
//! ```rust,no_run
//! use integrations_resilience::observability::{LogFormat, LogLevel, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! LoggingConfig::new()
//!     .with_level(LogLevel::Info)
//!     .with_format(LogFormat::Json)
//!     .init()?;
//! # Ok(())
//! # }
//! ```

mod logging;
mod metrics;

pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use metrics::{metric_names, InMemoryMetricsCollector, MetricsCollector, NoopMetricsCollector};
