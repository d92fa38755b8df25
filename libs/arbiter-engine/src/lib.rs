pub mod aggregator;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod runner;
pub mod toolchain;
pub mod workspace;

mod engine_tests;

pub use arbiter_common::types::{
    ExecutionRequest, JudgingResult, Language, TestCase, TestCaseResult, TestStatus, Verdict,
};
pub use config::EngineConfig;
pub use engine::JudgeEngine;
pub use error::{JudgeError, JudgeResult};
pub use toolchain::{ToolchainRegistry, ToolchainSpec};
