//! Execution Module
//!
//! Drives admitted operations to completion. The ledger decides what may run;
//! workers here only pull ready commands, hand them to a `CommandExecutor`,
//! and report the result. Several workers run concurrently and never receive
//! the same operation.

pub mod worker;

pub use worker::{CommandExecutor, WorkerPool, WorkerStats};
