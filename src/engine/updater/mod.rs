//! Companion Self-Update System
//!
//! A verified, crash-consistent update loop.
//!
//! Components:
//! - `feed` - Release list and channel selection
//! - `download` - Artifact download
//! - `verify` - Checksum and signature verification
//! - `deploy` - Extraction and atomic directory swap
//! - `state` - Persisted controller state
//! - `controller` - Timer-driven orchestration

pub mod controller;
pub mod deploy;
pub mod download;
pub mod error;
pub mod feed;
pub mod state;
pub mod verify;

pub use controller::{CheckReport, TickOutcome, UpdateController};
pub use deploy::{Deployer, DeploymentApplier, HostDeployer};
pub use error::UpdateError;
pub use state::{DeploymentState, UpdateStatus};
