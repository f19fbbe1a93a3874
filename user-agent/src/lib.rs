// src/lib.rs
// ────────────────────────────────────────────────────────────────────────────
// Public library entry point, shared by `main.rs` and the integration tests.

#[macro_use]
pub mod macros;

pub mod config;
pub mod comms;
pub mod pipeline;
pub mod scanner;
pub mod output;
