//! Checkpointed multi-stage workflow controller.
//!
//! A run takes one task through planning, a mandatory human approval gate,
//! building, reviewing, testing, diagnosing and a final write-up. Every
//! transition is checkpointed so an interrupted run resumes at the stage it
//! was about to execute.
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, ids, invariants).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (checkpoints, config, stage commands).
//!
//! Orchestration modules ([`controller`], [`looping`], [`step`], [`start`])
//! combine the two behind the [`Controller`] entry points.

pub mod approval;
pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod stage;
pub mod start;
pub mod state;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use controller::Controller;
pub use error::PipelineError;
pub use looping::RunOutcome;
