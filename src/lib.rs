//! datapilot: a multi-agent analysis engine that answers natural-language
//! business questions over heterogeneous relational datastores.
//!
//! Subsystems:
//! - database adapters + connection pool ([`core::db`])
//! - specialist agents over a [`core::llm::LanguageProvider`] ([`core::agents`])
//! - the analysis pipeline with a bounded SQL correction loop ([`core::analysis`])
//! - A2A planning and the execution state machine ([`core::planning`], [`core::execution`])
//! - the monitoring/diagnosis control loop ([`core::monitoring`])
//!
//! All wiring happens explicitly through [`core::services::Services`].

pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::EngineConfig;
pub use crate::core::error::{EngineError, ErrorKind, ResponseEnvelope};
pub use crate::core::services::Services;
