//! Operations
//!
//! The typed mutations produced by the differ or by user actions, and the
//! helpers that group them into batches.

pub mod batch;
pub mod entry;

pub use batch::{BatchBuilder, UidGenerator};
pub use entry::{BatchId, OpId, OpKind, Operation};
