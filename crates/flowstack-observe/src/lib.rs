//! Observability setup for Flowstack.

pub mod tracing_setup;
