/// Verdict Aggregator
///
/// **Core Responsibility:**
/// Drive test cases strictly in order and reduce their outcomes to one
/// verdict.
///
/// **State machine:**
/// `Compiling → Running(0) → … → Running(N-1) → Done(verdict)`
/// - A failed compile jumps straight to `Done(CompilationError)` with one
///   synthesized failed entry per test case; nothing is executed
/// - A timeout or runtime error on test `i` appends that result and stops:
///   `results.len() == i + 1`
/// - A wrong answer is recorded and the next test still runs
/// - After the last test: Accepted if every test passed, else WrongAnswer
///
/// Test cases are never run in parallel; the early stop on the first fatal
/// outcome has to be deterministic.

use crate::evaluator::{Evaluation, Evaluator, TestOutcome, TestRun};
use arbiter_common::types::{JudgingResult, TestCase, TestCaseResult, Verdict};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compiling,
    Running(usize),
    Done(Verdict),
}

#[derive(Debug)]
pub struct VerdictAggregator {
    total: usize,
    phase: Phase,
    results: Vec<TestCaseResult>,
    error_message: Option<String>,
}

impl VerdictAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            phase: Phase::Compiling,
            results: Vec::with_capacity(total),
            error_message: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `Compiling → Done(CompilationError)`
    pub fn compilation_failed(&mut self, test_cases: &[TestCase], message: impl Into<String>) {
        if self.phase != Phase::Compiling {
            warn!(phase = ?self.phase, "Compilation failure reported outside Compiling");
            return;
        }
        self.results = test_cases
            .iter()
            .enumerate()
            .map(|(index, tc)| TestCaseResult::not_compiled(index, tc))
            .collect();
        self.error_message = Some(message.into());
        self.phase = Phase::Done(Verdict::CompilationError);
    }

    /// `Compiling → Running(0)`, or straight to `Done` with no tests.
    pub fn compiled(&mut self) {
        if self.phase != Phase::Compiling {
            warn!(phase = ?self.phase, "Compilation success reported outside Compiling");
            return;
        }
        self.phase = if self.total == 0 {
            Phase::Done(Verdict::Accepted)
        } else {
            Phase::Running(0)
        };
    }

    /// Record the evaluation of the current test and advance.
    pub fn record(&mut self, evaluation: Evaluation) -> Phase {
        let Phase::Running(index) = self.phase else {
            warn!(phase = ?self.phase, "Test result recorded outside Running");
            return self.phase;
        };
        let outcome = evaluation.outcome;
        let error = evaluation.result.error.clone();
        self.results.push(evaluation.result);

        self.phase = match outcome {
            TestOutcome::TimeLimitExceeded => {
                self.error_message = Some(format!("Time limit exceeded on test case {}", index + 1));
                Phase::Done(Verdict::TimeLimitExceeded)
            }
            TestOutcome::RuntimeError => {
                self.error_message = error;
                Phase::Done(Verdict::RuntimeError)
            }
            TestOutcome::InternalError => {
                self.error_message = Some("Internal error while judging".to_string());
                Phase::Done(Verdict::RuntimeError)
            }
            TestOutcome::Cancelled => {
                self.error_message = Some("Judging cancelled".to_string());
                Phase::Done(Verdict::RuntimeError)
            }
            TestOutcome::Passed | TestOutcome::WrongAnswer if index + 1 < self.total => {
                Phase::Running(index + 1)
            }
            TestOutcome::Passed | TestOutcome::WrongAnswer => {
                if self.passed() == self.total {
                    Phase::Done(Verdict::Accepted)
                } else {
                    Phase::Done(Verdict::WrongAnswer)
                }
            }
        };
        self.phase
    }

    /// Stop with a runtime error from any non-final phase.
    pub fn abort(&mut self, message: impl Into<String>) {
        if let Phase::Done(_) = self.phase {
            return;
        }
        self.error_message = Some(message.into());
        self.phase = Phase::Done(Verdict::RuntimeError);
    }

    fn passed(&self) -> usize {
        self.results.iter().filter(|r| r.passed).count()
    }

    pub fn finish(mut self) -> JudgingResult {
        if !matches!(self.phase, Phase::Done(_)) {
            warn!(phase = ?self.phase, "Judging finished before reaching a verdict");
            self.abort("Judging ended before all test cases ran");
        }
        let verdict = match self.phase {
            Phase::Done(verdict) => verdict,
            _ => Verdict::RuntimeError,
        };

        JudgingResult {
            verdict,
            total_runtime_ms: self.results.iter().map(|r| r.runtime_ms).sum(),
            test_cases_passed: self.passed(),
            total_test_cases: self.total,
            results: self.results,
            error_message: self.error_message,
            judged_at: Utc::now(),
        }
    }
}

/// Run every test case in order until the aggregator reaches a verdict.
pub async fn run_test_cases(
    mut aggregator: VerdictAggregator,
    evaluator: &Evaluator<'_>,
    run: &TestRun<'_>,
    test_cases: &[TestCase],
    cancel: &CancellationToken,
) -> JudgingResult {
    aggregator.compiled();
    info!(test_count = test_cases.len(), "Executing test cases");

    while let Phase::Running(index) = aggregator.phase() {
        if cancel.is_cancelled() {
            warn!(
                completed = index,
                total = test_cases.len(),
                "Judging cancelled, stopping execution"
            );
            aggregator.abort("Judging cancelled");
            break;
        }

        let evaluation = evaluator.evaluate(run, index, &test_cases[index], cancel).await;
        if evaluation.outcome.is_fatal() {
            warn!(
                test_index = index,
                outcome = ?evaluation.outcome,
                runtime_ms = evaluation.result.runtime_ms,
                "Fatal test outcome; skipping remaining test cases"
            );
        } else {
            debug!(test_index = index, passed = evaluation.result.passed, "Test case done");
        }
        aggregator.record(evaluation);
    }

    aggregator.finish()
}
