//! The orchestration engine.
//!
//! A run goes through three phases: `Plan::new` validates the document
//! and expands every matrix, the [`gate`] decides when each job's
//! instances may start, and the [`scheduler`] drives instances through
//! the [`executor`] concurrently until every one is terminal.

pub mod executor;
pub mod gate;
pub mod matrix;
pub mod plan;
pub mod scheduler;
pub mod testing;

pub use executor::{CancelFlag, Executor};
pub use plan::{JobPlan, Plan, StepPlan};
pub use scheduler::Scheduler;
