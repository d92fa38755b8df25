/// End-to-end tests for the judging engine
///
/// These drive the full pipeline: policy, workspace, compile, per-test
/// execution, aggregation and cleanup.
///
/// The default suite registers `sh`-based toolchains so it runs on any host
/// with a POSIX shell:
/// - python: interpreted, `sh {source}`
/// - cpp: "compiled" with `sh -n` (syntax check only), run with `sh`
/// - java: public-class entry rule, otherwise like cpp
///
/// Tests against real interpreters and compilers are `#[ignore]`d.

#[cfg(all(test, unix))]
mod judging_tests {
    use crate::config::EngineConfig;
    use crate::engine::JudgeEngine;
    use crate::error::JudgeError;
    use crate::toolchain::{EntryRule, ToolchainRegistry, ToolchainSpec};
    use arbiter_common::types::{
        ExecutionRequest, Language, TestCase, TestStatus, Verdict,
    };
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const TWO_SUM: &str = r#"
read n
read nums
read target
set -- $nums
i=0
for a in "$@"; do
  j=0
  for b in "$@"; do
    if [ $i -lt $j ] && [ $((a + b)) -eq $target ]; then
      echo "$i $j"
      exit 0
    fi
    j=$((j + 1))
  done
  i=$((i + 1))
done
"#;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn sh_registry() -> ToolchainRegistry {
        ToolchainRegistry::from_specs(vec![
            ToolchainSpec {
                language: Language::Python,
                source_extension: "sh".into(),
                compile: None,
                run: argv(&["sh", "{source}"]),
                entry: EntryRule::default(),
                banned_patterns: argv(&["import os"]),
                memory_limit_enforced: false,
            },
            ToolchainSpec {
                language: Language::Cpp,
                source_extension: "sh".into(),
                compile: Some(argv(&["sh", "-n", "{source}"])),
                run: argv(&["sh", "{source}"]),
                entry: EntryRule::default(),
                banned_patterns: Vec::new(),
                memory_limit_enforced: false,
            },
            ToolchainSpec {
                language: Language::Java,
                source_extension: "java".into(),
                compile: Some(argv(&["sh", "-n", "{source}"])),
                run: argv(&["sh", "{source}"]),
                entry: EntryRule::PublicClass,
                banned_patterns: Vec::new(),
                memory_limit_enforced: false,
            },
        ])
        .expect("Failed to build test registry")
    }

    fn test_config(root: &Path) -> EngineConfig {
        EngineConfig {
            workspace_root: root.to_path_buf(),
            compile_timeout_ms: 5_000,
            kill_grace_ms: 200,
            ..Default::default()
        }
    }

    fn create_engine(root: &Path) -> JudgeEngine {
        JudgeEngine::new(test_config(root), sh_registry()).expect("Failed to create engine")
    }

    fn request(language: Language, source: &str, test_cases: Vec<TestCase>) -> ExecutionRequest {
        ExecutionRequest::new(language, source, test_cases, 2_000, 256)
    }

    fn assert_root_empty(root: &Path) {
        let leftovers: Vec<_> = std::fs::read_dir(root)
            .expect("Failed to read workspace root")
            .collect();
        assert!(leftovers.is_empty(), "workspaces left behind: {:?}", leftovers);
    }

    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                !state.starts_with('Z')
            }
            Err(_) => false,
        }
    }

    async fn read_pid(path: &Path) -> u32 {
        for _ in 0..100 {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(pid) = raw.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("pid file {} never written", path.display());
    }

    async fn assert_eventually_dead(pid: u32) {
        for _ in 0..100 {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {} survived judging", pid);
    }

    /// Source that starts a background sleeper, records its pid, and waits.
    fn sleeper_source(pid_file: &Path) -> String {
        format!("sleep 30 &\necho $! > {}\nwait\n", pid_file.display())
    }

    /// Two-sum accepted on the only test case
    #[tokio::test]
    async fn test_accepted_two_sum() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let result = engine
            .judge(request(
                Language::Python,
                TWO_SUM,
                vec![TestCase::new("4\n2 7 11 15\n9", "0 1")],
            ))
            .await
            .expect("Judging failed");

        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(result.test_cases_passed, 1);
        assert_eq!(result.total_test_cases, 1);
        assert_eq!(result.results[0].actual_output, "0 1");
        assert_eq!(result.error_message, None);
        assert_root_empty(root.path());
    }

    /// Escaped newlines in stored input are converted before execution
    #[tokio::test]
    async fn test_escaped_newlines_in_input() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let result = engine
            .judge(request(
                Language::Python,
                TWO_SUM,
                vec![TestCase::new("4\\n2 7 11 15\\n9", "0 1")],
            ))
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::Accepted);
    }

    /// Compile failure stops before any test runs
    #[tokio::test]
    async fn test_compilation_error_runs_nothing() {
        let root = TempDir::new().unwrap();
        let markers = TempDir::new().unwrap();
        let marker = markers.path().join("ran");
        let engine = create_engine(root.path());

        let source = format!("touch {}\nif then fi\n", marker.display());
        let tests = vec![
            TestCase::new("1", "1"),
            TestCase::new("2", "2"),
            TestCase::new("3", "3"),
        ];
        let result = engine
            .judge(request(Language::Cpp, &source, tests))
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::CompilationError);
        assert_eq!(result.test_cases_passed, 0);
        assert_eq!(result.results.len(), 3);
        assert!(result
            .results
            .iter()
            .all(|r| r.status == TestStatus::CompilationError && !r.passed));
        let message = result.error_message.expect("compiler output missing");
        assert!(!message.is_empty());
        assert!(!marker.exists(), "program executed despite compile failure");
        assert_root_empty(root.path());
    }

    /// Interpreted language: a syntax error surfaces at run time
    #[tokio::test]
    async fn test_interpreted_syntax_error_is_runtime_error() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let result = engine
            .judge(request(
                Language::Python,
                "if then fi\n",
                vec![TestCase::new("", "x"), TestCase::new("", "x")],
            ))
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::RuntimeError);
        assert_eq!(result.results.len(), 1);
        assert!(result.error_message.is_some());
        assert!(result.results[0].error.is_some());
    }

    /// Timeout on the first test stops the run and kills the program
    #[tokio::test]
    async fn test_time_limit_exceeded_kills_program() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let pid_file = scratch.path().join("pid");
        let engine = create_engine(root.path());

        let mut req = request(
            Language::Python,
            &sleeper_source(&pid_file),
            vec![
                TestCase::new("", "a"),
                TestCase::new("", "b"),
                TestCase::new("", "c"),
            ],
        );
        req.time_limit_ms = 300;

        let started = Instant::now();
        let result = engine.judge(req).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.verdict, Verdict::TimeLimitExceeded);
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].status, TestStatus::TimeLimitExceeded);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Time limit exceeded on test case 1")
        );

        let pid = read_pid(&pid_file).await;
        assert_eventually_dead(pid).await;
        assert_root_empty(root.path());
    }

    /// Wrong answer on test 2 does not stop test 3
    #[tokio::test]
    async fn test_wrong_answer_runs_all_tests() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let source = "read x\nif [ \"$x\" = 2 ]; then echo wrong; else echo ok; fi\n";
        let tests = vec![
            TestCase::new("1", "ok"),
            TestCase::new("2", "ok"),
            TestCase::new("3", "ok"),
        ];
        let result = engine
            .judge(request(Language::Python, source, tests))
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::WrongAnswer);
        assert_eq!(result.results.len(), 3);
        assert_eq!(result.test_cases_passed, 2);
        assert_eq!(result.results[1].status, TestStatus::WrongAnswer);
        assert_eq!(result.results[1].actual_output, "wrong");
        assert!(result.results[2].passed);
    }

    /// Runtime error at test k leaves exactly k + 1 results
    #[tokio::test]
    async fn test_runtime_error_stops_after_failing_test() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let source = "read x\nif [ \"$x\" = 2 ]; then exit 3; fi\necho ok\n";
        let tests = (1..=4).map(|i| TestCase::new(i.to_string(), "ok")).collect();
        let result = engine
            .judge(request(Language::Cpp, source, tests))
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::RuntimeError);
        assert_eq!(result.results.len(), 2);
        assert_eq!(result.test_cases_passed, 1);
        assert_eq!(result.total_test_cases, 4);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Process exited with code 3")
        );
    }

    /// Same request judged twice gives the same verdict and results
    #[tokio::test]
    async fn test_judging_is_repeatable() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let source = "read x\necho $((x * 2))\n";
        let req = request(
            Language::Cpp,
            source,
            vec![TestCase::new("5", "10"), TestCase::new("7", "15")],
        );

        let first = engine.judge(req.clone()).await.unwrap();
        let second = engine.judge(req).await.unwrap();

        assert_eq!(first.verdict, Verdict::WrongAnswer);
        assert_eq!(first.verdict, second.verdict);
        assert_eq!(first.test_cases_passed, second.test_cases_passed);
        let statuses = |r: &arbiter_common::types::JudgingResult| {
            r.results
                .iter()
                .map(|t| (t.status, t.actual_output.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(statuses(&first), statuses(&second));
        assert_root_empty(root.path());
    }

    /// Unknown or unconfigured language is rejected before any workspace
    #[tokio::test]
    async fn test_unsupported_language_is_an_error() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let err = engine
            .judge(request(Language::Go, "package main", vec![TestCase::new("", "")]))
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::UnsupportedLanguage(ref l) if l == "go"));

        let err = engine
            .judge_submission("x", "cobol", vec![], 1000, 64)
            .await
            .unwrap_err();
        assert!(matches!(err, JudgeError::UnsupportedLanguage(ref l) if l == "cobol"));
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_judge_submission_accepts_aliases() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let result = engine
            .judge_submission("echo hi", "py", vec![TestCase::new("", "hi")], 1000, 64)
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);
    }

    /// Banned constructs never reach a process
    #[tokio::test]
    async fn test_policy_violation_is_compilation_error() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let result = engine
            .judge(request(
                Language::Python,
                "import os\necho hi",
                vec![TestCase::new("", "hi")],
            ))
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::CompilationError);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Disallowed construct: import os")
        );
        assert_eq!(result.results.len(), 1);
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_oversized_source_is_rejected() {
        let root = TempDir::new().unwrap();
        let config = EngineConfig {
            max_source_chars: 16,
            ..test_config(root.path())
        };
        let engine = JudgeEngine::new(config, sh_registry()).unwrap();

        let result = engine
            .judge(request(
                Language::Python,
                "echo this source is far too long",
                vec![TestCase::new("", "")],
            ))
            .await
            .unwrap();

        assert_eq!(result.verdict, Verdict::CompilationError);
        assert!(result
            .error_message
            .unwrap()
            .contains("exceeding the limit of 16"));
    }

    /// Java-style entry: the source file is named after the public class
    #[tokio::test]
    async fn test_public_class_names_source_file() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let source = "# public class Main\nbasename \"$0\"\n";
        let result = engine
            .judge(request(Language::Java, source, vec![TestCase::new("", "Main.java")]))
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);

        let missing = engine
            .judge(request(Language::Java, "echo nope", vec![TestCase::new("", "")]))
            .await
            .unwrap();
        assert_eq!(missing.verdict, Verdict::CompilationError);
        assert_eq!(
            missing.error_message.as_deref(),
            Some("No class declaration found")
        );
        assert_root_empty(root.path());
    }

    #[tokio::test]
    async fn test_no_test_cases_is_accepted() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let result = engine
            .judge(request(Language::Cpp, "echo unused", vec![]))
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(result.total_test_cases, 0);
        assert!(result.results.is_empty());
    }

    /// Cancelling mid-run kills the program and reports it
    #[tokio::test]
    async fn test_cancellation_kills_running_program() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let pid_file = scratch.path().join("pid");
        let engine = create_engine(root.path());

        let mut req = request(
            Language::Python,
            &sleeper_source(&pid_file),
            vec![TestCase::new("", "")],
        );
        req.time_limit_ms = 30_000;

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = engine.judge_with_cancel(req, token).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.verdict, Verdict::RuntimeError);
        assert_eq!(result.error_message.as_deref(), Some("Judging cancelled"));

        let pid = read_pid(&pid_file).await;
        assert_eventually_dead(pid).await;
        assert_root_empty(root.path());
    }

    /// Dropping the judge future cancels the run
    #[tokio::test]
    async fn test_dropped_caller_kills_program() {
        let root = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let pid_file = scratch.path().join("pid");
        let engine = create_engine(root.path());

        let mut req = request(
            Language::Python,
            &sleeper_source(&pid_file),
            vec![TestCase::new("", "")],
        );
        req.time_limit_ms = 30_000;

        let outcome = tokio::time::timeout(Duration::from_millis(500), engine.judge(req)).await;
        assert!(outcome.is_err(), "judging should still be running");

        let pid = read_pid(&pid_file).await;
        assert_eventually_dead(pid).await;

        for _ in 0..100 {
            if std::fs::read_dir(root.path()).unwrap().next().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("workspace not removed after caller went away");
    }

    #[tokio::test]
    async fn test_hidden_results_are_redacted() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        let source = "read x\necho $x\n";
        let result = engine
            .judge(request(
                Language::Python,
                source,
                vec![TestCase::new("1", "1"), TestCase::hidden("secret", "secret")],
            ))
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);

        let public = result.redacted();
        assert_eq!(public.results[0].input, "1");
        assert!(public.results[1].is_hidden);
        assert!(public.results[1].input.is_empty());
        assert!(public.results[1].actual_output.is_empty());
        assert!(public.results[1].passed);
    }

    /// Concurrent runs get separate workspaces and all clean up
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_runs_are_isolated() {
        let root = TempDir::new().unwrap();
        let engine = create_engine(root.path());

        // Each run writes a file into its cwd and fails if it already exists
        let source = "[ -e mark ] && exit 9\ntouch mark\nread x\necho $x\n";
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .judge(request(
                            Language::Python,
                            source,
                            vec![TestCase::new(i.to_string(), i.to_string())],
                        ))
                        .await
                })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.verdict, Verdict::Accepted);
        }
        assert_root_empty(root.path());
    }

    // Real toolchains. Run with `--ignored` on a host with python3, g++ and a JDK.

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_real_python_two_sum() {
        let root = TempDir::new().unwrap();
        let engine = JudgeEngine::new(test_config(root.path()), ToolchainRegistry::builtin())
            .expect("Failed to create engine");

        let source = r#"
n = int(input())
nums = list(map(int, input().split()))
target = int(input())
seen = {}
for i, x in enumerate(nums):
    if target - x in seen:
        print(seen[target - x], i)
        break
    seen[x] = i
"#;
        let result = engine
            .judge(request(
                Language::Python,
                source,
                vec![TestCase::new("4\n2 7 11 15\n9", "0 1")],
            ))
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);

        let broken = engine
            .judge(request(
                Language::Python,
                "print(",
                vec![TestCase::new("", "")],
            ))
            .await
            .unwrap();
        assert_eq!(broken.verdict, Verdict::RuntimeError);
        assert!(broken.error_message.unwrap().contains("SyntaxError"));
    }

    #[tokio::test]
    #[ignore] // Requires g++
    async fn test_real_cpp_compile_error() {
        let root = TempDir::new().unwrap();
        let engine = JudgeEngine::new(test_config(root.path()), ToolchainRegistry::builtin())
            .expect("Failed to create engine");

        let result = engine
            .judge(request(
                Language::Cpp,
                "int main() { return 0 }",
                vec![TestCase::new("", ""), TestCase::new("", "")],
            ))
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::CompilationError);
        assert_eq!(result.results.len(), 2);
        assert!(result.error_message.unwrap().contains("error"));
    }

    #[tokio::test]
    #[ignore] // Requires a JDK
    async fn test_real_java_public_class() {
        let root = TempDir::new().unwrap();
        let engine = JudgeEngine::new(test_config(root.path()), ToolchainRegistry::builtin())
            .expect("Failed to create engine");

        let source = r#"
import java.util.Scanner;

public class Doubler {
    public static void main(String[] args) {
        Scanner in = new Scanner(System.in);
        System.out.println(in.nextInt() * 2);
    }
}
"#;
        let mut req = request(
            Language::Java,
            source,
            vec![TestCase::new("21", "42"), TestCase::new("5", "10")],
        );
        req.time_limit_ms = 5_000;
        let result = engine.judge(req).await.unwrap();
        assert_eq!(result.verdict, Verdict::Accepted);
        assert_eq!(result.test_cases_passed, 2);
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_real_memory_limit_enforced() {
        let root = TempDir::new().unwrap();
        let config = EngineConfig {
            enforce_memory_limit: true,
            ..test_config(root.path())
        };
        let engine = JudgeEngine::new(config, ToolchainRegistry::builtin()).unwrap();

        let mut req = request(
            Language::Python,
            "x = bytearray(512 * 1024 * 1024)\nprint(len(x))",
            vec![TestCase::new("", "536870912")],
        );
        req.memory_limit_mb = 64;
        let result = engine.judge(req).await.unwrap();
        assert_eq!(result.verdict, Verdict::RuntimeError);
        assert!(result.error_message.unwrap().contains("MemoryError"));
    }
}
