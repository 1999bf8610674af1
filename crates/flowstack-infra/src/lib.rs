//! Infrastructure implementations for Flowstack.
//!
//! Implements the port traits defined in `flowstack-core`:
//! - `sqlite` -- SQLite-backed workflow store (sqlx, WAL, split pools)
//! - `memory` -- in-process lock and queue backends for tests and
//!   single-instance deployments

pub mod memory;
pub mod sqlite;
