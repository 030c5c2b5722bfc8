//! Execution event distribution.

pub mod bus;
