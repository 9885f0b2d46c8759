//! Core domain logic for the Aleph harness: the home-directory layout,
//! filesystem primitives, inter-agent mail, channels, the task board, the
//! permission policy, and the typed runtime stream.
//!
//! Everything here is synchronous and runtime-agnostic; the `aleph` binary
//! drives it from its tokio event loop.

pub mod agent;
pub mod board;
pub mod channel;
pub mod diff;
pub mod fsio;
pub mod hooks;
pub mod ids;
pub mod inbox;
pub mod message;
pub mod paths;
pub mod permissions;
pub mod registry;
pub mod stream;
