use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Languages the judging engine knows how to name.
///
/// Whether a language can actually be judged depends on the toolchain
/// registry the engine was started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Cpp,
    Java,
    Go,
    Rust,
}

impl Language {
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::JavaScript,
        Language::Cpp,
        Language::Java,
        Language::Go,
        Language::Rust,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Cpp => "cpp",
            Language::Java => "java",
            Language::Go => "go",
            Language::Rust => "rust",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "cpp" | "c++" => Ok(Language::Cpp),
            "java" => Ok(Language::Java),
            "go" | "golang" => Ok(Language::Go),
            "rust" | "rs" => Ok(Language::Rust),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// One input/expected-output pair. Owned by the problem; the engine only
/// reads it for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
}

impl TestCase {
    pub fn new(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            is_hidden: false,
        }
    }

    pub fn hidden(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            is_hidden: true,
            ..Self::new(input, expected_output)
        }
    }
}

/// A submission to judge. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub language: Language,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    pub time_limit_ms: u64,
    /// Advisory unless the engine is configured to enforce it.
    pub memory_limit_mb: u64,
}

impl ExecutionRequest {
    pub fn new(
        language: Language,
        source_code: impl Into<String>,
        test_cases: Vec<TestCase>,
        time_limit_ms: u64,
        memory_limit_mb: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            language,
            source_code: source_code.into(),
            test_cases,
            time_limit_ms,
            memory_limit_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    RuntimeError,
    CompilationError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Accepted => "ACCEPTED",
            Verdict::WrongAnswer => "WRONG_ANSWER",
            Verdict::TimeLimitExceeded => "TIME_LIMIT_EXCEEDED",
            Verdict::RuntimeError => "RUNTIME_ERROR",
            Verdict::CompilationError => "COMPILATION_ERROR",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    WrongAnswer,
    TimeLimitExceeded,
    RuntimeError,
    CompilationError,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub index: usize,
    pub status: TestStatus,
    pub passed: bool,
    pub is_hidden: bool,
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub runtime_ms: u64,
    pub error: Option<String>,
}

impl TestCaseResult {
    /// Placeholder entry for a test that never ran because compilation failed.
    pub fn not_compiled(index: usize, test_case: &TestCase) -> Self {
        Self {
            index,
            status: TestStatus::CompilationError,
            passed: false,
            is_hidden: test_case.is_hidden,
            input: test_case.input.clone(),
            expected_output: test_case.expected_output.clone(),
            actual_output: String::new(),
            runtime_ms: 0,
            error: Some("Compilation Error".to_string()),
        }
    }
}

/// The single value handed back to callers of the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgingResult {
    pub verdict: Verdict,
    pub total_runtime_ms: u64,
    pub test_cases_passed: usize,
    pub total_test_cases: usize,
    pub results: Vec<TestCaseResult>,
    pub error_message: Option<String>,
    pub judged_at: DateTime<Utc>,
}

impl JudgingResult {
    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }

    /// Copy with the contents of hidden test cases blanked out.
    pub fn redacted(&self) -> Self {
        let results = self
            .results
            .iter()
            .map(|r| {
                if r.is_hidden {
                    TestCaseResult {
                        input: String::new(),
                        expected_output: String::new(),
                        actual_output: String::new(),
                        ..r.clone()
                    }
                } else {
                    r.clone()
                }
            })
            .collect();

        Self {
            results,
            ..self.clone()
        }
    }
}
