//! `casegen-core`: shared building blocks.
//!
//! Identifiers and the external-call error taxonomy. No IO, no runtime.

pub mod error;
pub mod id;

pub use error::{CallError, ErrorKind, InvalidId};
pub use id::{FileId, TaskId};
