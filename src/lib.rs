//! Gamify Experiments Library
//!
//! A/B experiment engine for a learning-gamification product.
//!
//! # Key Features
//! - Sticky variant assignment (weighted random, feature rules, cohorts, hash)
//! - Eligibility filtering by segment, profile criteria and sampling
//! - Online per-variant metric aggregation with compare-and-swap rows
//! - Approximate statistics: confidence, p-values, power, sample ratio checks
//! - Human-readable reports with a recommendation and next steps
//!
//! # Storage
//! - In-memory store for tests and embedding
//! - RocksDB embedded storage (no external database)

pub mod config;
pub mod constants;
pub mod errors;
pub mod experiment;
pub mod metrics;
pub mod storage;
pub mod tracing_setup;
pub mod validation;

pub use config::EngineConfig;
pub use errors::{ExperimentError, Result, StoreError};
pub use experiment::{ExperimentEngine, ExperimentSummary};
pub use storage::{ExperimentFilter, ExperimentStore, InMemoryStore, RocksStore, WriteMode};

// Re-export dependencies to ensure tests/benchmarks use the same version
pub use chrono;
pub use parking_lot;
pub use uuid;
