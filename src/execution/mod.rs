//! Pipeline execution

pub mod background;
pub mod engine;
pub mod host;
pub mod publish;
pub mod report;
pub mod retry;
pub mod runner;

pub use background::{BackgroundError, BackgroundReport, BackgroundSupervisor, TaskHandle};
pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent};
pub use host::{CommandHost, HostError, HostOutput, Invocation, ShellHost};
pub use publish::{ArtifactPublisher, DirectoryPublisher, DryRunPublisher, PublishError};
pub use report::RunReport;
pub use retry::with_retry;
pub use runner::CommandRunner;
