//! stepline - a declarative build-step orchestrator for CI agents

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;

// Re-export commonly used types
pub use core::{
    Condition, EnvironmentFacts, FactLedger, FactsProvider, Pipeline, PipelineStatus, RunState,
    Step, StepOutcome, StepRecord, StepResult,
};
pub use execution::{
    ArtifactPublisher, CommandHost, DirectoryPublisher, DryRunPublisher, ExecutionEngine,
    ExecutionEvent, RunReport, ShellHost,
};
