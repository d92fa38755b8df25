/// Judging Engine
///
/// **Core Responsibility:**
/// Single entry point that turns an ExecutionRequest into a JudgingResult:
/// source policy, workspace, compile once, run every test case, clean up.
///
/// **Lifecycle of one run:**
/// 1. Resolve the toolchain (unknown language is the only error returned)
/// 2. Check the source against the toolchain policy
/// 3. Acquire a workspace and write the source
/// 4. Compile if the toolchain needs it
/// 5. Drive the test cases through the aggregator
/// 6. Release the workspace (also on drop, cancel or panic)
///
/// Each run executes on its own task so a panic or an overrun of the overall
/// deadline is contained and still produces a verdict.

use crate::aggregator::{run_test_cases, Phase, VerdictAggregator};
use crate::config::EngineConfig;
use crate::error::JudgeResult;
use crate::evaluator::{Evaluator, TestRun};
use crate::metrics;
use crate::policy;
use crate::runner::{ProcessRunner, RunOutcome, RunRequest};
use crate::toolchain::{CommandLine, ToolchainRegistry, ToolchainSpec};
use crate::workspace::WorkspaceManager;
use arbiter_common::types::{ExecutionRequest, JudgingResult, Language, TestCase};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

const INTERNAL_ERROR_MESSAGE: &str = "Internal error while judging";
const DEADLINE_MESSAGE: &str = "Judging exceeded its overall time budget";
const CANCELLED_MESSAGE: &str = "Judging cancelled";

/// Result of the compile step.
#[derive(Debug, PartialEq, Eq)]
enum Compilation {
    Succeeded,
    Failed(String),
    Cancelled,
    /// The compiler could not be started at all
    Unavailable,
}

fn compile_error_message(outcome: &RunOutcome) -> String {
    if outcome.timed_out {
        return "Compilation timed out".to_string();
    }
    let stderr = outcome.stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    let stdout = outcome.stdout.trim();
    if !stdout.is_empty() {
        return stdout.to_string();
    }
    "Compilation failed".to_string()
}

/// Limits applied while waiting for one judging task.
struct RunBounds {
    submission_id: Uuid,
    total: usize,
    deadline: Duration,
    /// How long a cancelled task gets to clean up before it is aborted
    grace: Duration,
}

/// Wait for a judging task, turning a panic or a missed deadline into a
/// runtime error. The task has finished or been dropped when this returns.
async fn settle(
    mut handle: JoinHandle<JudgingResult>,
    bounds: RunBounds,
    run_token: &CancellationToken,
) -> JudgingResult {
    match tokio::time::timeout(bounds.deadline, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!(
                submission_id = %bounds.submission_id,
                panicked = e.is_panic(),
                error = %e,
                "Judging task failed"
            );
            aborted(bounds.total, INTERNAL_ERROR_MESSAGE)
        }
        Err(_) => {
            warn!(
                submission_id = %bounds.submission_id,
                deadline_ms = bounds.deadline.as_millis() as u64,
                "Judging exceeded overall deadline, cancelling"
            );
            run_token.cancel();
            // Give the task a moment to kill its processes and remove the workspace
            if tokio::time::timeout(bounds.grace, &mut handle).await.is_err() {
                error!(
                    submission_id = %bounds.submission_id,
                    "Judging task did not stop, aborting"
                );
                handle.abort();
                // Resolves once the aborted task has been dropped
                let _ = handle.await;
            }
            aborted(bounds.total, DEADLINE_MESSAGE)
        }
    }
}

fn aborted(total: usize, message: &str) -> JudgingResult {
    let mut aggregator = VerdictAggregator::new(total);
    aggregator.abort(message);
    aggregator.finish()
}

struct EngineInner {
    config: EngineConfig,
    registry: ToolchainRegistry,
    workspaces: WorkspaceManager,
    runner: ProcessRunner,
}

/// Cheap to clone; clones share the registry and workspace root.
#[derive(Clone)]
pub struct JudgeEngine {
    inner: Arc<EngineInner>,
}

impl JudgeEngine {
    pub fn new(config: EngineConfig, registry: ToolchainRegistry) -> JudgeResult<Self> {
        let workspaces = WorkspaceManager::new(&config.workspace_root)?;
        let runner = ProcessRunner::new(config.max_output_bytes, config.kill_grace());

        info!(
            workspace_root = %config.workspace_root.display(),
            languages = ?registry.languages(),
            enforce_memory_limit = config.enforce_memory_limit,
            "Judge engine initialized"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                registry,
                workspaces,
                runner,
            }),
        })
    }

    /// Build an engine from `ARBITER_*` environment variables, loading
    /// languages.json when `ARBITER_LANGUAGES_CONFIG` is set.
    pub fn from_env() -> JudgeResult<Self> {
        let config = EngineConfig::from_env()?;
        let registry = match &config.languages_config {
            Some(path) => ToolchainRegistry::load(path)?,
            None => ToolchainRegistry::builtin(),
        };
        Self::new(config, registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn supported_languages(&self) -> Vec<Language> {
        self.inner.registry.languages()
    }

    pub async fn judge(&self, request: ExecutionRequest) -> JudgeResult<JudgingResult> {
        self.judge_with_cancel(request, CancellationToken::new()).await
    }

    /// Judge raw submission fields, parsing the language name first.
    pub async fn judge_submission(
        &self,
        source_code: &str,
        language: &str,
        test_cases: Vec<TestCase>,
        time_limit_ms: u64,
        memory_limit_mb: u64,
    ) -> JudgeResult<JudgingResult> {
        let language: Language = language.parse()?;
        let request = ExecutionRequest::new(
            language,
            source_code,
            test_cases,
            time_limit_ms,
            memory_limit_mb,
        );
        self.judge(request).await
    }

    /// Judge `request`, stopping early once `cancel` fires.
    ///
    /// Only an unsupported language is returned as an error; it is detected
    /// before any workspace or process exists. Every other failure becomes
    /// part of the verdict.
    pub async fn judge_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> JudgeResult<JudgingResult> {
        let language = request.language;
        self.inner.registry.resolve(language)?;

        let started = Instant::now();
        let total = request.test_cases.len();
        let submission_id = request.id;
        let deadline = self
            .inner
            .config
            .overall_deadline(total, request.time_limit_ms);

        let run_token = cancel.child_token();
        // Dropping this future (caller went away) cancels the run
        let _cancel_on_drop = run_token.clone().drop_guard();

        let inner = Arc::clone(&self.inner);
        let task_token = run_token.clone();
        let handle = tokio::spawn(async move { inner.run(request, task_token).await });

        let result = settle(
            handle,
            RunBounds {
                submission_id,
                total,
                deadline,
                grace: self.inner.config.kill_grace() * 2,
            },
            &run_token,
        )
        .await;

        metrics::JUDGEMENTS_TOTAL
            .with_label_values(&[result.verdict.as_str(), language.as_str()])
            .inc();
        metrics::JUDGE_DURATION_SECONDS
            .with_label_values(&[language.as_str()])
            .observe(started.elapsed().as_secs_f64());

        Ok(result)
    }
}

impl EngineInner {
    #[instrument(
        skip_all,
        fields(
            submission_id = %request.id,
            language = %request.language,
            test_count = request.test_cases.len()
        )
    )]
    async fn run(&self, request: ExecutionRequest, cancel: CancellationToken) -> JudgingResult {
        let total = request.test_cases.len();
        let mut aggregator = VerdictAggregator::new(total);

        let toolchain = match self.registry.resolve(request.language) {
            Ok(toolchain) => toolchain,
            Err(e) => {
                error!(error = %e, "Toolchain disappeared between checks");
                aggregator.abort(INTERNAL_ERROR_MESSAGE);
                return aggregator.finish();
            }
        };

        let source = match policy::check_source(
            &request.source_code,
            toolchain,
            self.config.max_source_chars,
        ) {
            Ok(source) => source,
            Err(violation) => {
                warn!(%violation, "Source rejected by policy");
                aggregator.compilation_failed(&request.test_cases, violation.to_string());
                return aggregator.finish();
            }
        };

        let Some(entry) = toolchain.entry_symbol(&source) else {
            aggregator.compilation_failed(&request.test_cases, "No class declaration found");
            return aggregator.finish();
        };

        let mut workspace = match self.workspaces.acquire(&request.id.to_string()).await {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = ?e, "Failed to acquire workspace");
                aggregator.abort(INTERNAL_ERROR_MESSAGE);
                return aggregator.finish();
            }
        };

        let paths = toolchain.build_paths(workspace.path(), &entry);
        if let Err(e) = workspace.write_file(&paths.source, &source).await {
            error!(error = ?e, workspace = %workspace.id(), "Failed to write source");
            aggregator.abort(INTERNAL_ERROR_MESSAGE);
            workspace.release().await;
            return aggregator.finish();
        }

        if let Some(compile) = toolchain.compile_command(&paths) {
            match self.compile(&compile, workspace.path(), &cancel).await {
                Compilation::Succeeded => {}
                Compilation::Failed(message) => {
                    aggregator.compilation_failed(&request.test_cases, message)
                }
                Compilation::Cancelled => aggregator.abort(CANCELLED_MESSAGE),
                Compilation::Unavailable => aggregator.abort(INTERNAL_ERROR_MESSAGE),
            }
        }

        let result = if aggregator.phase() == Phase::Compiling {
            let command = toolchain.run_command(&paths);
            let run = TestRun {
                command: &command,
                cwd: workspace.path(),
                time_limit_ms: request.time_limit_ms,
                memory_limit_bytes: self.memory_limit_bytes(toolchain, request.memory_limit_mb),
            };
            let evaluator = Evaluator::new(
                &self.runner,
                self.config.max_test_input_bytes,
                self.config.normalize_input_newlines,
            );
            run_test_cases(aggregator, &evaluator, &run, &request.test_cases, &cancel).await
        } else {
            aggregator.finish()
        };

        workspace.release().await;

        info!(
            verdict = %result.verdict,
            passed = result.test_cases_passed,
            total = result.total_test_cases,
            runtime_ms = result.total_runtime_ms,
            "Judging complete"
        );
        result
    }

    fn memory_limit_bytes(&self, toolchain: &ToolchainSpec, memory_limit_mb: u64) -> Option<u64> {
        (self.config.enforce_memory_limit && toolchain.memory_limit_enforced)
            .then(|| memory_limit_mb.saturating_mul(1024 * 1024))
    }

    async fn compile(
        &self,
        command: &CommandLine,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Compilation {
        info!(command = %command, "Compiling");
        let request = RunRequest {
            command,
            cwd,
            stdin: &[],
            timeout: self.config.compile_timeout(),
            memory_limit_bytes: None,
        };

        match self.runner.run(request, cancel).await {
            Ok(outcome) if outcome.cancelled => Compilation::Cancelled,
            Ok(outcome) if outcome.success() => {
                info!(wall_time_ms = outcome.wall_time_ms, "Compilation succeeded");
                Compilation::Succeeded
            }
            Ok(outcome) => {
                warn!(
                    exit_code = ?outcome.exit_code,
                    timed_out = outcome.timed_out,
                    "Compilation failed"
                );
                Compilation::Failed(compile_error_message(&outcome))
            }
            Err(e) => {
                error!(command = %command, error = ?e, "Failed to start compiler");
                Compilation::Unavailable
            }
        }
    }
}
