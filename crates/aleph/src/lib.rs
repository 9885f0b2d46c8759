//! The Aleph harness binary's library surface.
//!
//! `aleph-core` holds the pure coordination fabric; this crate wires it to
//! a live `claude` subprocess, the hook socket, the console, and tmux.

pub mod arbiter;
pub mod config;
pub mod dispatcher;
pub mod hook_bus;
pub mod hook_service;
pub mod ipc;
pub mod runtime;
pub mod session;
pub mod spawner;
pub mod ui;
