//! # releasekit
//!
//! Release orchestration and safety engine.
//!
//! This crate ships a new release of an application to a host and keeps a
//! bad release from staying live:
//! - Preflight checks batched into one remote round trip, failing fast
//! - Environment files merged from layers with secrets substituted
//! - Dependency installs and asset builds reused by content fingerprint
//! - Database backups before migrations, with retention and restore
//! - Atomic activation by symlink swap, health verification, rollback
//!
//! Every remote side effect goes through a [`conduit::Conduit`], so the
//! whole pipeline runs against a scripted conduit in tests.
//!
//! ## Example
//!
//! ```no_run
//! use releasekit::conduit::{HostRef, LocalConduit};
//! use releasekit::config::Settings;
//! use releasekit::context::{AutoDecline, DeployContext, NoProgress};
//! use releasekit::health::UreqProbe;
//! use releasekit::pipeline::Pipeline;
//! use releasekit::secrets::{self, ProcessEnv};
//!
//! let mut settings = Settings::new("shop", "staging", HostRef::Local, "/srv/shop");
//! settings.domain = Some("staging.example.com".to_string());
//!
//! let secrets = secrets::resolve(&settings.secrets, &ProcessEnv)?;
//! let conduit = LocalConduit::new();
//! let probe = UreqProbe::from_config(&settings.verify);
//! let mut ctx = DeployContext::new(&settings, &conduit, &secrets, &probe, Box::new(AutoDecline));
//!
//! let report = Pipeline::deploy().run(&mut ctx, &mut NoProgress);
//! if let Some(error) = report.primary_error() {
//!     eprintln!("{error}\n{}", error.guidance());
//! }
//! # Ok::<(), releasekit::Error>(())
//! ```
//!
//! ## Failure handling
//!
//! A failing phase stops the pipeline. The unlock and rollback hooks still
//! run; an unhealthy release is rolled back to the previous one and the
//! rollback target is checked with a single quick verification.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backup;
pub mod cache;
pub mod conduit;
pub mod config;
pub mod context;
pub mod envfile;
pub mod error;
pub mod health;
pub mod migrate;
pub mod phases;
pub mod pipeline;
pub mod preflight;
pub mod release;
pub mod retry;
pub mod secrets;
pub mod service;
pub mod shell;

pub use error::{Error, ErrorCategory, Result};
