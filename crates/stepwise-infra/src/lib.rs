//! Infrastructure layer for Stepwise.
//!
//! Contains the implementation of the `RunRepository` trait defined in
//! `stepwise-core` (SQLite with split reader/writer pools), the
//! `config.toml` loader, and data directory resolution.

pub mod config;
pub mod filesystem;
pub mod sqlite;
