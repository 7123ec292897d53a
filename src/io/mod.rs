//! Side-effecting adapters: filesystem, git, process execution, HTTP.

pub mod agent;
pub mod config;
pub mod git;
pub mod knowledge;
pub mod process;
pub mod teacher;
pub mod verifier;
