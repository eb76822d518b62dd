//! Observability wiring for stepwise: log formatting and optional
//! OpenTelemetry span export.

pub mod tracing_setup;
