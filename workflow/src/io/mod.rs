//! I/O adapters: checkpoints, config, rules and command-backed stages.

pub mod checkpoint;
pub mod config;
pub mod init;
pub mod process;
pub mod rules;
pub mod stage_command;
