//! Staged resume pipeline: stage payloads, the segment descriptor, the
//! orchestrator that gates segments, and the executor that runs each stage.

pub mod ats;
pub mod descriptor;
pub mod executor;
pub mod handlers;
pub mod orchestrator;
pub mod stages;

pub use executor::PipelineExecutor;
pub use orchestrator::{Orchestrator, PipelineError};
