//! Forge Agent - drives a build from request to runnable codebase
//!
//! This crate owns everything that talks to a code-generation backend:
//!
//! 1. **Synthesis client** (`client`, `providers`, `key_pool`): one call
//!    interface over OpenAI-compatible backends, with credential rotation
//!    and backoff on rate limits
//! 2. **Planner** (`planner`): request -> validated [`BuildManifest`](forge_core::BuildManifest)
//! 3. **File synthesis loop** (`synthesis_loop`, `review`): write, review,
//!    auto-fix and syntax-repair every planned file
//! 4. **Diagnosis & patch** (`diagnosis`): bounded run/diagnose/patch cycles
//!    over a [`SandboxRunner`](forge_sandbox::SandboxRunner)
//! 5. **Orchestrator** (`orchestrator`, `report`): sequences a build and
//!    returns a [`BuildReport`]
//!
//! Stages share one [`BuildContext`] per build. Every synthesis call goes
//! through it, so cost accounting and the one-time downgrade to the
//! fallback model happen in a single place.
//!
//! # Example
//!
//! ```no_run
//! use forge_agent::{BuildOptions, BuildOrchestrator, EngineConfig, SynthesisClient};
//! use forge_core::ConstraintMemory;
//! use forge_sandbox::SandboxSupervisor;
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = EngineConfig::default();
//! let profile = config.profile()?;
//! let client = SynthesisClient::from_env(config.registry(), config.client_settings());
//! let sandbox = SandboxSupervisor::detect(config.sandbox_config(&profile)).await?;
//! let constraints = ConstraintMemory::open(&config.constraints_path).await?;
//!
//! let orchestrator = BuildOrchestrator::new(
//!     config,
//!     Arc::new(client),
//!     Arc::new(sandbox),
//!     Arc::new(constraints),
//! )?;
//! let report = orchestrator
//!     .run(&BuildOptions::new("a CLI that prints the weather", "builds/weather"))
//!     .await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod client;
pub mod config;
pub mod diagnosis;
pub mod key_pool;
pub mod orchestrator;
pub mod packaging;
pub mod planner;
pub mod prompts;
pub mod providers;
pub mod report;
pub mod review;
pub mod roster;
pub mod session;
pub mod synthesis_loop;

pub use client::{ClientSettings, Synthesis, SynthesisClient, Synthesizer};
pub use config::EngineConfig;
pub use diagnosis::{Diagnosis, DiagnosisPatchLoop, StopReason, VerificationOutcome};
pub use key_pool::{KeyPool, KeyRing};
pub use orchestrator::{BuildOptions, BuildOrchestrator, Phase};
pub use planner::BlueprintPlanner;
pub use report::BuildReport;
pub use review::{ReviewGate, ReviewOutcome};
pub use roster::{ModelRoster, Role};
pub use session::BuildContext;
pub use synthesis_loop::{FileState, FileSynthesisLoop, SynthesisSettings, SynthesisStats};
