//! Live terminal rendering of execution events
//!
//! Each step gets a `[N/M] Name` header and a spinner while it runs. When a
//! step fails, the tail of its output is printed under the result line.

use crate::{
    cli::output::{create_step_spinner, format_event, format_output_tail},
    execution::ExecutionEvent,
};
use console::style;
use indicatif::ProgressBar;
use std::io::{self, Write};
use std::sync::Mutex;

/// Lines of failed step output shown in the terminal
const FAILURE_TAIL_LINES: usize = 20;

/// Renders engine events as they arrive
#[derive(Debug)]
pub struct TerminalReporter {
    total_steps: usize,
    show_output: bool,
    spinner: Mutex<Option<ProgressBar>>,
}

impl TerminalReporter {
    /// `show_output` also prints the output of successful steps
    pub fn new(total_steps: usize, show_output: bool) -> Self {
        Self {
            total_steps,
            show_output,
            spinner: Mutex::new(None),
        }
    }

    /// Handle one event. Meant to be registered as an engine event handler.
    pub fn handle(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::StepStarted {
                display_name,
                index,
                ..
            } => {
                self.print_separator();
                println!("{}", self.step_header(index + 1, display_name));
                self.set_spinner(Some(create_step_spinner(display_name.clone())));
            }
            ExecutionEvent::StepFinished { result, .. } => {
                self.set_spinner(None);
                if let Some(line) = format_event(event) {
                    println!("{}", line);
                }
                let failed = result.outcome.is_failure();
                if failed || self.show_output {
                    for stream in [&result.stdout, &result.stderr] {
                        if !stream.trim().is_empty() {
                            println!("{}", format_output_tail(stream, FAILURE_TAIL_LINES));
                        }
                    }
                }
            }
            other => {
                if let Some(line) = format_event(other) {
                    self.println(&line);
                }
            }
        }
        self.flush_stdout();
    }

    /// Format: `[N/M] Step Name`
    fn step_header(&self, step_num: usize, step_name: &str) -> String {
        format!(
            "[{}/{}] {}",
            style(step_num).cyan(),
            style(self.total_steps).dim(),
            style(step_name).bold()
        )
    }

    /// A horizontal rule spanning the terminal width
    fn print_separator(&self) {
        let width = term_size::dimensions_stdout()
            .map(|(w, _)| w)
            .unwrap_or(80);
        println!("{}", style("─".repeat(width)).dim());
    }

    fn set_spinner(&self, spinner: Option<ProgressBar>) {
        if let Ok(mut current) = self.spinner.lock() {
            if let Some(previous) = current.take() {
                previous.finish_and_clear();
            }
            *current = spinner;
        }
    }

    /// Print without tearing an active spinner
    fn println(&self, line: &str) {
        if let Ok(current) = self.spinner.lock() {
            if let Some(spinner) = current.as_ref() {
                spinner.println(line);
                return;
            }
        }
        println!("{}", line);
    }

    fn flush_stdout(&self) {
        let _ = io::stdout().flush();
    }
}
