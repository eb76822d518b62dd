//! Shared domain types for Stepwise.
//!
//! This crate contains the data model of the durable step orchestrator:
//! workflow runs, step records, retry policies, duration values, global
//! configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod duration;
pub mod error;
pub mod policy;
pub mod run;
pub mod step;
