/// Test Case Evaluator
///
/// **Core Responsibility:**
/// Run the program once for one test case and decide what happened.
///
/// **Classification (first match wins):**
/// 1. Cancelled by the caller
/// 2. Timed out (runner deadline hit, or wall time beyond the limit)
/// 3. Runtime error: output limit, non-zero exit, signal, or anything on stderr
/// 4. Output comparison: Passed or WrongAnswer
///
/// **Normalization Rules:**
/// - Trim leading and trailing whitespace: YES
/// - Internal whitespace: significant
/// - Case sensitivity: YES (exact match required)

use crate::runner::{ProcessRunner, RunOutcome, RunRequest};
use crate::toolchain::CommandLine;
use arbiter_common::types::{TestCase, TestCaseResult, TestStatus};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// What a single test case means for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    WrongAnswer,
    TimeLimitExceeded,
    RuntimeError,
    /// The engine could not run the program at all
    InternalError,
    Cancelled,
}

impl TestOutcome {
    /// Fatal outcomes stop the remaining test cases.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TestOutcome::Passed | TestOutcome::WrongAnswer)
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub outcome: TestOutcome,
    pub result: TestCaseResult,
}

/// Per-run parameters shared by every test case.
#[derive(Debug, Clone)]
pub struct TestRun<'a> {
    pub command: &'a CommandLine,
    pub cwd: &'a Path,
    pub time_limit_ms: u64,
    pub memory_limit_bytes: Option<u64>,
}

/// Normalize output string for comparison
fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// Turn stored test input into what the program reads on stdin.
///
/// Stored inputs sometimes carry literal `\n` sequences instead of line
/// breaks; with `normalize_newlines` those are converted. A trailing newline
/// is always ensured, since most programs read line by line.
pub fn prepare_input(raw: &str, normalize_newlines: bool) -> String {
    let mut input = if normalize_newlines && raw.contains("\\n") {
        raw.replace("\\n", "\n")
    } else {
        raw.to_string()
    };
    if !input.ends_with('\n') {
        input.push('\n');
    }
    input
}

fn runtime_error_message(run: &RunOutcome) -> String {
    if run.output_limit_exceeded {
        return "Output limit exceeded".to_string();
    }
    if !run.stderr.is_empty() {
        return run.stderr.clone();
    }
    match (run.signal, run.exit_code) {
        (Some(signal), _) => format!("Killed by signal {}", signal),
        (None, Some(code)) => format!("Process exited with code {}", code),
        (None, None) => "Process terminated abnormally".to_string(),
    }
}

/// Classify a finished run of test case `index`.
pub fn classify(
    index: usize,
    test_case: &TestCase,
    run: &RunOutcome,
    time_limit_ms: u64,
) -> Evaluation {
    let actual = normalize_output(&run.stdout);
    let expected = normalize_output(&test_case.expected_output);

    let (outcome, status, error) = if run.cancelled {
        (
            TestOutcome::Cancelled,
            TestStatus::RuntimeError,
            Some("Judging cancelled".to_string()),
        )
    } else if run.timed_out || run.wall_time_ms > time_limit_ms {
        (
            TestOutcome::TimeLimitExceeded,
            TestStatus::TimeLimitExceeded,
            Some("Time limit exceeded".to_string()),
        )
    } else if run.output_limit_exceeded || run.exit_code != Some(0) || !run.stderr.is_empty() {
        (
            TestOutcome::RuntimeError,
            TestStatus::RuntimeError,
            Some(runtime_error_message(run)),
        )
    } else if actual == expected {
        (TestOutcome::Passed, TestStatus::Passed, None)
    } else {
        (TestOutcome::WrongAnswer, TestStatus::WrongAnswer, None)
    };

    Evaluation {
        outcome,
        result: TestCaseResult {
            index,
            status,
            passed: outcome == TestOutcome::Passed,
            is_hidden: test_case.is_hidden,
            input: test_case.input.clone(),
            expected_output: expected.to_string(),
            actual_output: actual.to_string(),
            runtime_ms: run.wall_time_ms,
            error,
        },
    }
}

fn internal_error(index: usize, test_case: &TestCase, message: &str) -> Evaluation {
    Evaluation {
        outcome: TestOutcome::InternalError,
        result: TestCaseResult {
            index,
            status: TestStatus::RuntimeError,
            passed: false,
            is_hidden: test_case.is_hidden,
            input: test_case.input.clone(),
            expected_output: normalize_output(&test_case.expected_output).to_string(),
            actual_output: String::new(),
            runtime_ms: 0,
            error: Some(message.to_string()),
        },
    }
}

pub struct Evaluator<'a> {
    runner: &'a ProcessRunner,
    max_input_bytes: usize,
    normalize_newlines: bool,
}

impl<'a> Evaluator<'a> {
    pub fn new(runner: &'a ProcessRunner, max_input_bytes: usize, normalize_newlines: bool) -> Self {
        Self {
            runner,
            max_input_bytes,
            normalize_newlines,
        }
    }

    /// Run test case `index` and classify the result.
    pub async fn evaluate(
        &self,
        run: &TestRun<'_>,
        index: usize,
        test_case: &TestCase,
        cancel: &CancellationToken,
    ) -> Evaluation {
        let input = prepare_input(&test_case.input, self.normalize_newlines);
        if input.len() > self.max_input_bytes {
            error!(
                test_index = index,
                input_bytes = input.len(),
                limit = self.max_input_bytes,
                "Test input exceeds maximum size"
            );
            return internal_error(index, test_case, "Test input exceeds maximum size");
        }

        let outcome = self
            .runner
            .run(
                RunRequest {
                    command: run.command,
                    cwd: run.cwd,
                    stdin: input.as_bytes(),
                    timeout: Duration::from_millis(run.time_limit_ms),
                    memory_limit_bytes: run.memory_limit_bytes,
                },
                cancel,
            )
            .await;

        match outcome {
            Ok(outcome) => {
                let evaluation = classify(index, test_case, &outcome, run.time_limit_ms);
                debug!(
                    test_index = index,
                    outcome = ?evaluation.outcome,
                    wall_time_ms = outcome.wall_time_ms,
                    exit_code = ?outcome.exit_code,
                    "Test case evaluated"
                );
                evaluation
            }
            Err(e) => {
                error!(
                    test_index = index,
                    command = %run.command,
                    error = ?e,
                    "Failed to execute program"
                );
                internal_error(index, test_case, "Execution failed")
            }
        }
    }
}
