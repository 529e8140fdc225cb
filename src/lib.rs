//! Modcheck - incremental validation cache for content packages
//!
//! Caches validation results keyed by content identity, invalidates them
//! precisely when their input files or declared dependencies change, and
//! revalidates affected packages concurrently within resource bounds.
//!
//! The pieces, leaf-first:
//!
//! - [`cache::CacheStore`] holds results in memory and on disk
//! - [`batch::BatchOrchestrator`] runs independent tasks with bounded concurrency
//! - [`pipeline::ValidationPipeline`] checks one package through the cache
//! - [`coordinator::IncrementalCoordinator`] turns file changes into revalidation cycles
//! - [`monitor::PerformanceMonitor`] tracks timings and hit rates

pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod package;
pub mod pipeline;

pub use error::{ModcheckError, ModcheckResult};
