//! Integration tests for the Snapshot pipeline
//!
//! Drives the event processor and the poller dispatcher end to end over the
//! in-memory queue, inventory and directory. No AWS access is needed.

pub mod fixtures;
pub mod pipeline;
