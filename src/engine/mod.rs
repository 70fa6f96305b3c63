//! Execution engine for stagehand
//!
//! The engine orchestrates:
//! 1. Targeting - Resolve a stage into settings, secrets and a conduit
//! 2. Executing - Run the deploy pipeline for one or more stages in parallel
//! 3. Diffing - Compare the live environment file with the desired one

pub mod differ;
pub mod executor;
pub mod target;

pub use executor::{DeployOptions, deploy_stages, print_summary};
pub use target::{SecretMode, Target};
