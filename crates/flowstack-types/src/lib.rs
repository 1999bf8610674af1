//! Shared domain types for Flowstack.
//!
//! This crate contains the core domain types used across the Flowstack
//! platform: workflow definitions, queue jobs, module descriptors, engine
//! configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod job;
pub mod module;
pub mod workflow;
