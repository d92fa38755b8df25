// Engine configuration: limits, timeouts, and where things live on disk.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MAX_SOURCE_CHARS: usize = 10_000;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1MB
pub const DEFAULT_MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
pub const DEFAULT_KILL_GRACE_MS: u64 = 500;
pub const DEFAULT_DEADLINE_SLACK_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parent directory for per-submission workspaces
    pub workspace_root: PathBuf,
    /// Compile budget, independent of the per-test time limit
    pub compile_timeout_ms: u64,
    pub max_source_chars: usize,
    /// Cap on captured stdout and on captured stderr, each
    pub max_output_bytes: usize,
    pub max_test_input_bytes: usize,
    /// Apply memory_limit_mb as RLIMIT_AS. Off means the limit is advisory.
    pub enforce_memory_limit: bool,
    /// Turn literal `\n` sequences in stored inputs into newlines
    pub normalize_input_newlines: bool,
    /// How long to wait for pipes to drain after a process group is killed
    pub kill_grace_ms: u64,
    /// Extra headroom on top of the computed overall judging deadline
    pub deadline_slack_ms: u64,
    /// Optional languages.json overriding the built-in toolchains
    pub languages_config: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("arbiter-workspaces"),
            compile_timeout_ms: DEFAULT_COMPILE_TIMEOUT_MS,
            max_source_chars: DEFAULT_MAX_SOURCE_CHARS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_test_input_bytes: DEFAULT_MAX_TEST_INPUT_BYTES,
            enforce_memory_limit: false,
            normalize_input_newlines: true,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
            deadline_slack_ms: DEFAULT_DEADLINE_SLACK_MS,
            languages_config: None,
        }
    }
}

impl EngineConfig {
    /// Build configuration from `ARBITER_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("ARBITER_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Ok(path) = std::env::var("ARBITER_LANGUAGES_CONFIG") {
            config.languages_config = Some(PathBuf::from(path));
        }

        env_parse("ARBITER_COMPILE_TIMEOUT_MS", &mut config.compile_timeout_ms)?;
        env_parse("ARBITER_MAX_SOURCE_CHARS", &mut config.max_source_chars)?;
        env_parse("ARBITER_MAX_OUTPUT_BYTES", &mut config.max_output_bytes)?;
        env_parse("ARBITER_MAX_TEST_INPUT_BYTES", &mut config.max_test_input_bytes)?;
        env_parse("ARBITER_ENFORCE_MEMORY_LIMIT", &mut config.enforce_memory_limit)?;
        env_parse(
            "ARBITER_NORMALIZE_INPUT_NEWLINES",
            &mut config.normalize_input_newlines,
        )?;
        env_parse("ARBITER_KILL_GRACE_MS", &mut config.kill_grace_ms)?;
        env_parse("ARBITER_DEADLINE_SLACK_MS", &mut config.deadline_slack_ms)?;

        Ok(config)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Upper bound for one whole judging run with `test_count` tests.
    ///
    /// Each runner call ends within its timeout plus one kill grace, since
    /// stdout and stderr are drained within the same grace period.
    pub fn overall_deadline(&self, test_count: usize, time_limit_ms: u64) -> Duration {
        let per_test = time_limit_ms.saturating_add(self.kill_grace_ms);
        let total = self
            .compile_timeout_ms
            .saturating_add(self.kill_grace_ms)
            .saturating_add(per_test.saturating_mul(test_count as u64))
            .saturating_add(self.deadline_slack_ms);
        Duration::from_millis(total)
    }
}

fn env_parse<T>(key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Ok(raw) = std::env::var(key) {
        *slot = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
    }
    Ok(())
}
