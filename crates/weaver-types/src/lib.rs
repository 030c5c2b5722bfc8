//! Shared domain types for Weaver.
//!
//! This crate contains the types that cross component boundaries: the
//! workflow definition format, execution statuses and node errors, activity
//! results, execution events, and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, thiserror, schemars.

pub mod config;
pub mod event;
pub mod execution;
pub mod workflow;
