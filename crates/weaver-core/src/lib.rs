//! Workflow execution core for Weaver.
//!
//! Compiles workflow definitions into executable plans and drives them to
//! completion: dependency-ordered scheduling, switch branching, loops,
//! error policies, credit metering, and execution events. Node bodies are
//! never run here; they go through the [`activity::NodeActivity`] contract.
//!
//! Depends only on `weaver-types` and async/runtime utilities -- no HTTP,
//! database, or provider SDKs.

pub mod activity;
pub mod config;
pub mod credit;
pub mod event;
pub mod telemetry;
pub mod workflow;
