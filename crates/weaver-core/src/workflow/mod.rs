//! Workflow execution core: compilation, scheduling, and the engine driver.
//!
//! - `definition` -- JSON/YAML parsing, content hashing, filesystem load/save
//! - `compiler` -- graph validation, depth levels, loop body extraction
//! - `cache` -- compiled plans shared by content hash
//! - `context` -- write-once node outputs and `{{ }}` template resolution
//! - `queue` -- per-scope node state machine with a replayable journal
//! - `switch` / `loop_handler` / `replan` -- control-flow handling
//! - `retry` -- attempt and backoff decisions for failed activities
//! - `expression` -- JEXL evaluation for switch cases
//! - `checkpoint` -- execution snapshots and their stores
//! - `engine` -- admission, the scheduling actor, and result assembly

pub mod cache;
pub mod checkpoint;
pub mod compiler;
pub mod context;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod loop_handler;
pub mod queue;
pub mod replan;
pub mod retry;
pub mod switch;
