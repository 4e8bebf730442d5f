//! The remediation cycle
//!
//! Run the suite, parse failures, dispatch every failure, repeat. A clean
//! run ends the cycle successfully (and publishes whatever was changed).
//! The first failure no tier can fix ends it with a rollback of everything
//! this cycle wrote. Running out of passes ends it with changes left in
//! place.

use crate::dispatch::FixDispatcher;
use crate::error::{FixError, FixResult};
use crate::failure::{self, FailureRecord};
use crate::runner::TestRunner;
use crate::vcs::Vcs;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_COMMIT_MESSAGE: &str = "Automated test fixes";

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The suite passed on pass `attempts`.
    Fixed {
        attempts: u32,
        files_changed: Vec<PathBuf>,
    },
    /// No tier could fix `failure`; the cycle's changes were rolled back.
    CouldNotFix { failure: FailureRecord, attempts: u32 },
    /// Failures remained after the last allowed pass.
    MaxRetriesReached { attempts: u32, remaining: usize },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Fixed { .. })
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Fixed { files_changed, .. } if files_changed.is_empty() => {
                write!(f, "all tests pass")
            }
            CycleOutcome::Fixed { files_changed, .. } => {
                write!(f, "all tests pass ({} file(s) fixed)", files_changed.len())
            }
            CycleOutcome::CouldNotFix { failure, .. } => {
                write!(f, "could not fix {}", failure.file.display())
            }
            CycleOutcome::MaxRetriesReached { .. } => write!(f, "max retries reached"),
        }
    }
}

/// Publishing settings
#[derive(Debug, Clone)]
pub struct PublishPolicy {
    pub enabled: bool,
    pub commit_message: String,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
        }
    }
}

pub struct Orchestrator<R, V> {
    runner: R,
    vcs: V,
    dispatcher: FixDispatcher,
    max_retries: u32,
    publish: PublishPolicy,
}

impl<R: TestRunner, V: Vcs> Orchestrator<R, V> {
    pub fn new(runner: R, vcs: V, dispatcher: FixDispatcher) -> Self {
        Self {
            runner,
            vcs,
            dispatcher,
            max_retries: DEFAULT_MAX_RETRIES,
            publish: PublishPolicy::default(),
        }
    }

    /// At least one pass always runs.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_publish(mut self, publish: PublishPolicy) -> Self {
        self.publish = publish;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    /// Run one full cycle. `Err` only for failures that leave the tree in
    /// an unknown state (a backup or rollback that could not be restored),
    /// a test suite that could not be started, or a run that timed out.
    pub fn run_cycle(&mut self) -> FixResult<CycleOutcome> {
        let mut touched: Vec<PathBuf> = Vec::new();
        let mut remaining = 0;

        for attempt in 1..=self.max_retries {
            info!(attempt, max = self.max_retries, "running test suite");
            let run = self.runner.run()?;
            if run.timed_out {
                // A killed run has no trustworthy summary; nothing it saw can be published.
                warn!(attempt, files = touched.len(), "test run timed out; rolling back this cycle");
                self.vcs.rollback(&touched)?;
                return Err(FixError::TestRun(format!(
                    "test run timed out on pass {}",
                    attempt
                )));
            }
            let failures = failure::parse(&run.output);
            if let Some(summary) = failure::summary_line(&run.output) {
                debug!(
                    attempt,
                    failed = summary.failed,
                    passed = summary.passed,
                    duration_ms = run.duration_ms,
                    "test summary"
                );
            }

            if failures.is_empty() {
                if !run.passed {
                    warn!("test command failed without reporting test failures");
                }
                self.publish_changes(&touched);
                return Ok(CycleOutcome::Fixed {
                    attempts: attempt,
                    files_changed: touched,
                });
            }

            info!(attempt, failures = failures.len(), "dispatching failures");
            remaining = failures.len();
            for failure in failures {
                let report = match self.dispatcher.dispatch(&failure) {
                    Ok(report) => report,
                    Err(err) => {
                        error!(error = %err, "unrecoverable error while fixing; rolling back");
                        self.vcs.rollback(&touched)?;
                        return Err(err);
                    }
                };

                if !report.fixed() {
                    warn!(
                        file = %failure.file.display(),
                        test = %failure.test,
                        "no fix found; rolling back this cycle"
                    );
                    self.vcs.rollback(&touched)?;
                    return Ok(CycleOutcome::CouldNotFix {
                        failure,
                        attempts: attempt,
                    });
                }

                for file in report.files {
                    if !touched.contains(&file) {
                        touched.push(file);
                    }
                }
            }
        }

        warn!(attempts = self.max_retries, remaining, "max retries reached");
        Ok(CycleOutcome::MaxRetriesReached {
            attempts: self.max_retries,
            remaining,
        })
    }

    fn publish_changes(&mut self, touched: &[PathBuf]) {
        if touched.is_empty() {
            return;
        }
        if !self.publish.enabled {
            info!(files = touched.len(), "publishing disabled; leaving changes uncommitted");
            return;
        }
        if let Err(err) = self.vcs.commit_and_push(&self.publish.commit_message) {
            error!(error = %err, "failed to publish fixes");
        }
    }
}
