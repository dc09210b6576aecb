//! Companion - encrypted session storage and unattended self-update
//! for a long-running messaging companion service.

pub mod engine;
