//! Feedback-driven retry loop for AI coding agents.
//!
//! This crate implements a task retry model where a coding agent attempts a
//! task, a test suite verifies the result, and failed attempts are routed to
//! a teacher reasoning service that distills a corrective rule. Rules persist
//! in a markdown knowledge store and feed into every later attempt. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (failure records, rule parsing
//!   and fingerprinting, prompt routing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (agent and teacher invocation, git,
//!   test execution, the knowledge store). Isolated behind traits to enable
//!   scripting in tests.
//!
//! Orchestration modules ([`run`], [`report`]) coordinate core logic with I/O
//! to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
