//! `casegen-ai`
//!
//! **Responsibility:** AI jobs that run on the task engine.
//!
//! The model itself is a collaborator behind [`RequirementModel`]; this crate
//! only drives it:
//! - It never persists test cases; generated cases are the job's output.
//! - Every model call goes through a `ResilientCaller`.
//! - Jobs are submitted through [`AiScheduler`] and tracked as tasks.

pub mod case;
pub mod error;
pub mod generation;
pub mod job;
pub mod model;
pub mod scheduler;

pub use case::TestCase;
pub use error::{AiError, GenerationError};
pub use generation::GenerateCasesJob;
pub use job::AiJob;
pub use model::{ImageRef, RequirementModel};
pub use scheduler::AiScheduler;
