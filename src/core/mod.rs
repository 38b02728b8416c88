//! Core domain models for Pipeline
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, facts, conditions and their configuration.

pub mod condition;
pub mod config;
pub mod context;
pub mod facts;
pub mod pipeline;
pub mod state;
pub mod step;

pub use condition::{Condition, ConditionParseError, FactLookup, Operand};
pub use context::StepContext;
pub use facts::{EnvironmentFacts, FactLedger, FactView, FactsProvider};
pub use pipeline::*;
pub use state::*;
pub use step::*;
