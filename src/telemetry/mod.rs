//! Telemetry
//!
//! Observability components for the client core.
//!
//! - **Events**: state-change and statistics events behind [`TelemetrySink`]
//! - **Metrics**: call success rate and response time
//! - **Logging**: `tracing-subscriber` initialization

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{
    tracing_sink, InMemorySink, NoOpSink, SharedSink, TelemetryEvent, TelemetrySink, TracingSink,
};
pub use logging::{LogFormat, LogLevel, LoggingConfig};
pub use metrics::{ExecutorMetrics, MetricsSnapshot};
