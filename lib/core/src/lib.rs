//! Core types shared across the keel workflow engine.
//!
//! This crate provides the foundational identifier types and the error
//! handling alias used by every other keel crate.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, TaskId, WorkflowInstanceId};
