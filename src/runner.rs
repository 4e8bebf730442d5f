//! Test suite execution
//!
//! Runs the configured pytest command and hands its combined output to the
//! failure parser. The runner never interprets the output itself.

use crate::error::{FixError, FixResult};
use crate::util::{run_command_with_timeout, split_command_line, truncate};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

/// `-rf` makes pytest print the short `FAILED path::test - reason` summary.
pub const DEFAULT_TEST_COMMAND: &str = "pytest -rf --tb=short";

/// Output of one test-suite run
#[derive(Debug, Clone)]
pub struct TestRun {
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl TestRun {
    pub fn success(output: String, duration_ms: u64) -> Self {
        Self {
            passed: true,
            output,
            duration_ms,
            timed_out: false,
        }
    }

    pub fn failure(output: String, duration_ms: u64) -> Self {
        Self {
            passed: false,
            output,
            duration_ms,
            timed_out: false,
        }
    }
}

/// Something that can run the test suite and return its output
pub trait TestRunner: Send {
    fn run(&mut self) -> FixResult<TestRun>;
}

/// Runs an external command in the test root
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    working_dir: PathBuf,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandTestRunner {
    pub fn new(working_dir: impl Into<PathBuf>, command_line: &str, timeout: Duration) -> FixResult<Self> {
        let mut words = split_command_line(command_line).into_iter();
        let program = words
            .next()
            .ok_or_else(|| FixError::TestRun("test command is empty".to_string()))?;
        Ok(Self {
            working_dir: working_dir.into(),
            program,
            args: words.collect(),
            timeout,
        })
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl TestRunner for CommandTestRunner {
    fn run(&mut self) -> FixResult<TestRun> {
        if !looks_like_python_project(&self.working_dir) {
            warn!(
                dir = %self.working_dir.display(),
                "no Python project markers found; running the test command anyway"
            );
        }

        info!(command = %self.command_line(), dir = %self.working_dir.display(), "running tests");
        let mut command = Command::new(&self.program);
        command.current_dir(&self.working_dir).args(&self.args);

        let result = run_command_with_timeout(&mut command, self.timeout)
            .map_err(|e| FixError::TestRun(format!("{}: {}", self.program, e)))?;
        let duration_ms = result.duration.as_millis() as u64;
        let output = result.combined_output();
        debug!(tail = %truncate(output.trim_end(), 400), "test output");

        if result.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "test run timed out");
            return Ok(TestRun {
                timed_out: true,
                ..TestRun::failure(output, duration_ms)
            });
        }

        Ok(if result.success() {
            TestRun::success(output, duration_ms)
        } else {
            TestRun::failure(output, duration_ms)
        })
    }
}

fn looks_like_python_project(dir: &Path) -> bool {
    ["pyproject.toml", "setup.py", "setup.cfg", "requirements.txt", "pytest.ini", "conftest.py"]
        .iter()
        .any(|marker| dir.join(marker).exists())
        || dir.read_dir().is_ok_and(|mut entries| {
            entries.any(|e| {
                e.ok()
                    .and_then(|e| e.file_name().to_str().map(|n| n.ends_with(".py")))
                    .unwrap_or(false)
            })
        })
}
