//! Workflow execution engine and port trait definitions for Flowstack.
//!
//! This crate defines the orchestration core -- variable resolution, the
//! dependency graph, wave scheduling, step execution, the job queue manager,
//! and the leader-elected cron coordinator -- plus the "ports" (store, lock,
//! queue, credential traits) that the infrastructure layer implements. It
//! depends only on `flowstack-types`, never on a database or IO crate.

pub mod engine;
pub mod repository;
