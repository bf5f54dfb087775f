//! action-runner agent library
//!
//! A remote execution agent for CI runners. It dials a controller over a
//! WebSocket and executes the instructions it receives:
//! - Foreground and background command execution
//! - Workspace file reads and writes
//! - Job log output, secret masking and log groups
//! - Cache save/restore and expression evaluation through pluggable services

pub mod agent;
pub mod cache;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod evaluate;
pub mod executor;
pub mod jobs;
pub mod transport;
pub mod workspace;
