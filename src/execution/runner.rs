//! Command runner - one attempt of one step, under a timeout

use crate::{
    core::{StepContext, StepOutcome, StepResult},
    execution::host::{CommandHost, HostError, HostOutput, Invocation},
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How long a stopped host gets to wind down before its future is dropped
pub const DEFAULT_STOP_WAIT: Duration = Duration::from_secs(15);

/// Why a command did not run to completion
enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Runs command text through a [`CommandHost`]
///
/// The runner never retries; see [`crate::execution::retry`].
pub struct CommandRunner<H> {
    host: H,
    stop_wait: Duration,
}

impl<H: CommandHost> CommandRunner<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            stop_wait: DEFAULT_STOP_WAIT,
        }
    }

    pub fn with_stop_wait(mut self, stop_wait: Duration) -> Self {
        self.stop_wait = stop_wait;
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Run `command` with the step's environment.
    ///
    /// On timeout or cancellation the host is told to stop, and the result is
    /// only returned once it has terminated the command.
    pub async fn run(
        &self,
        command: &str,
        context: &StepContext,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StepResult {
        let invocation = Invocation {
            command: command.to_string(),
            env: context.env.clone(),
            working_dir: context.working_dir.clone(),
        };

        let started = Instant::now();
        let stop = cancel.child_token();
        let execution = self.host.execute(&invocation, &stop);
        tokio::pin!(execution);

        let interrupt = tokio::select! {
            biased;
            _ = cancel.cancelled() => Interrupt::Cancelled,
            result = &mut execution => return Self::finished(context, result, started.elapsed()),
            _ = tokio::time::sleep(timeout) => Interrupt::TimedOut,
        };

        stop.cancel();
        if tokio::time::timeout(self.stop_wait, &mut execution).await.is_err() {
            warn!(
                "Host did not stop step {} within {:?}",
                context.step_id, self.stop_wait
            );
        }
        let elapsed = started.elapsed();

        match interrupt {
            Interrupt::Cancelled => {
                warn!("Step {} cancelled after {:?}", context.step_id, elapsed);
                StepResult::new(StepOutcome::Cancelled, None, elapsed)
            }
            Interrupt::TimedOut => {
                error!("Timeout for step {} after {:?}", context.step_id, timeout);
                StepResult::new(StepOutcome::TimedOut, None, elapsed)
                    .with_output(String::new(), format!("timed out after {:?}", timeout))
            }
        }
    }

    fn finished(
        context: &StepContext,
        result: Result<HostOutput, HostError>,
        elapsed: Duration,
    ) -> StepResult {
        match result {
            Err(e) => {
                error!("Could not run step {}: {}", context.step_id, e);
                StepResult::new(StepOutcome::Failed, None, elapsed)
                    .with_output(String::new(), e.to_string())
            }
            Ok(output) => {
                let outcome = if output.exit_code == Some(0) {
                    StepOutcome::Succeeded
                } else {
                    StepOutcome::Failed
                };
                debug!(
                    "Step {} exited with {:?} in {:?}",
                    context.step_id, output.exit_code, output.duration
                );
                StepResult::new(outcome, output.exit_code, output.duration)
                    .with_output(output.stdout, output.stderr)
            }
        }
    }
}
