//! Profiling session library for kubectl-prof
//!
//! This crate provides the core functionality for:
//! - Language, tool and output catalogs
//! - Worker job and ephemeral container specifications
//! - Worker event stream decoding
//! - Verified retrieval of profiling results
//! - Session orchestration, single pod or fanned out over a selector

pub mod catalog;
pub mod config;
pub mod duration;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod observability;
pub mod printer;
pub mod retrieve;
pub mod session;
pub mod worker;

pub use catalog::{Compressor, Language, OutputType, ProfilingEvent, ProfilingTool};
pub use config::{JobConfig, LaunchMode, ProfilerConfig, TargetConfig};
pub use error::{ProfError, Result};
pub use gateway::{ClusterGateway, FakeGateway, GatewayError, KubeGateway};
pub use models::*;
pub use observability::SessionLogger;
pub use printer::Printer;
pub use session::{FanOutOutcome, FanOutScheduler, SessionOrchestrator, SessionTimings};
