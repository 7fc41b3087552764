//! Deterministic, pure logic shared by the pipeline controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! run state and return deterministic outputs suitable for tests.

pub mod ids;
pub mod invariants;
pub mod transitions;
pub mod types;
