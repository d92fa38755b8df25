// Language toolchain registry
//
// Maps a language to the data needed to build and run a submission:
// source extension, optional compile argv, run argv, how the source file is
// named, and which constructs the source policy rejects.
//
// The registry is built once (built-in defaults or languages.json) and is
// read-only afterwards, so it is shared across runs behind an Arc.

use crate::error::{JudgeError, JudgeResult};
use anyhow::{bail, Context, Result};
use arbiter_common::types::Language;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref CLASS_DECL: Regex = Regex::new(
        r"\b((?:(?:public|final|abstract|strictfp|sealed)\s+)*)class\s+([A-Za-z_$][A-Za-z0-9_$]*)"
    )
    .expect("class declaration pattern");
}

const PYTHON_BANNED: &[&str] = &[
    "import os",
    "from os import",
    "import subprocess",
    "from subprocess import",
    "__import__",
    "eval(",
    "exec(",
];

const NATIVE_BANNED: &[&str] = &["system(", "fork(", "popen(", "unistd.h", "windows.h"];

const JAVA_BANNED: &[&str] = &["Runtime.getRuntime().exec(", "ProcessBuilder"];

const JAVASCRIPT_BANNED: &[&str] = &["child_process", "eval(", "new Function("];

const GO_BANNED: &[&str] = &["os/exec", "syscall"];

const RUST_BANNED: &[&str] = &["std::process::Command", "libc::"];

/// How the entry symbol (and therefore the source file name) is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryRule {
    /// Always use this file stem
    Fixed { stem: String },
    /// Use the declared class name (Java requires `<Class>.java`)
    PublicClass,
}

impl Default for EntryRule {
    fn default() -> Self {
        EntryRule::Fixed {
            stem: "solution".to_string(),
        }
    }
}

/// A resolved program invocation. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Paths substituted into argv templates.
#[derive(Debug, Clone)]
pub struct BuildPaths {
    pub dir: PathBuf,
    pub source: PathBuf,
    pub artifact: PathBuf,
    pub entry: String,
}

impl BuildPaths {
    fn substitute(&self, template: &str) -> String {
        template
            .replace("{source}", &self.source.to_string_lossy())
            .replace("{dir}", &self.dir.to_string_lossy())
            .replace("{artifact}", &self.artifact.to_string_lossy())
            .replace("{entry}", &self.entry)
    }

    fn render(&self, template: &[String]) -> CommandLine {
        let mut parts = template.iter().map(|part| self.substitute(part));
        // Templates are validated non-empty when the registry is built
        let program = parts.next().unwrap_or_default();
        CommandLine {
            program,
            args: parts.collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainSpec {
    pub language: Language,
    pub source_extension: String,
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    pub entry: EntryRule,
    pub banned_patterns: Vec<String>,
    pub memory_limit_enforced: bool,
}

impl ToolchainSpec {
    pub fn requires_compilation(&self) -> bool {
        self.compile.is_some()
    }

    /// Determine the entry symbol for `source`, or `None` when the source
    /// declares nothing usable.
    pub fn entry_symbol(&self, source: &str) -> Option<String> {
        match &self.entry {
            EntryRule::Fixed { stem } => Some(stem.clone()),
            EntryRule::PublicClass => {
                let classes = top_level_classes(source);
                classes
                    .iter()
                    .find(|(public, _)| *public)
                    .or_else(|| classes.first())
                    .map(|(_, name)| name.clone())
            }
        }
    }

    pub fn build_paths(&self, dir: &Path, entry: &str) -> BuildPaths {
        BuildPaths {
            dir: dir.to_path_buf(),
            source: dir.join(format!("{}.{}", entry, self.source_extension)),
            artifact: dir.join(entry),
            entry: entry.to_string(),
        }
    }

    pub fn compile_command(&self, paths: &BuildPaths) -> Option<CommandLine> {
        self.compile.as_deref().map(|t| paths.render(t))
    }

    pub fn run_command(&self, paths: &BuildPaths) -> CommandLine {
        paths.render(&self.run)
    }

    fn validate(&self) -> Result<()> {
        if self.source_extension.is_empty()
            || !self.source_extension.chars().all(|c| c.is_ascii_alphanumeric())
        {
            bail!(
                "{}: source extension must be alphanumeric, got {:?}",
                self.language,
                self.source_extension
            );
        }
        if self.run.is_empty() || self.run[0].trim().is_empty() {
            bail!("{}: run command is empty", self.language);
        }
        if let Some(compile) = &self.compile {
            if compile.is_empty() || compile[0].trim().is_empty() {
                bail!("{}: compile command is empty", self.language);
            }
        }
        if let EntryRule::Fixed { stem } = &self.entry {
            if stem.is_empty() || !stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                bail!("{}: invalid entry stem {:?}", self.language, stem);
            }
        }
        Ok(())
    }
}

/// Blank out comments and string, char and text-block literals so that
/// neither braces nor words inside them are mistaken for code.
fn strip_comments_and_literals(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
                out.push(' ');
                continue;
            }
            '"' if next == Some('"') && chars.get(i + 2) == Some(&'"') => {
                i += 3;
                while i < chars.len() && !chars[i..].starts_with(&['"', '"', '"']) {
                    i += if chars[i] == '\\' { 2 } else { 1 };
                }
                i += 3;
                out.push(' ');
                continue;
            }
            '"' | '\'' => {
                i += 1;
                while i < chars.len() && chars[i] != c && chars[i] != '\n' {
                    i += if chars[i] == '\\' { 2 } else { 1 };
                }
                i += 1;
                out.push(' ');
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

/// Top-level class declarations in order, flagged when declared `public`.
fn top_level_classes(source: &str) -> Vec<(bool, String)> {
    let cleaned = strip_comments_and_literals(source);
    let mut classes = Vec::new();
    let mut depth = 0usize;
    let mut scanned = 0;

    for caps in CLASS_DECL.captures_iter(&cleaned) {
        let (Some(decl), Some(modifiers), Some(name)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        for c in cleaned[scanned..decl.start()].chars() {
            match c {
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                _ => {}
            }
        }
        scanned = decl.start();

        if depth == 0 {
            let public = modifiers.as_str().split_whitespace().any(|m| m == "public");
            classes.push((public, name.as_str().to_string()));
        }
    }
    classes
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn patterns(parts: &[&str]) -> Vec<String> {
    argv(parts)
}

fn builtin_spec(language: Language) -> ToolchainSpec {
    let fixed = EntryRule::default();
    match language {
        Language::Python => ToolchainSpec {
            language,
            source_extension: "py".into(),
            compile: None,
            run: argv(&["python3", "{source}"]),
            entry: fixed,
            banned_patterns: patterns(PYTHON_BANNED),
            memory_limit_enforced: true,
        },
        Language::JavaScript => ToolchainSpec {
            language,
            source_extension: "js".into(),
            compile: None,
            run: argv(&["node", "{source}"]),
            entry: fixed,
            banned_patterns: patterns(JAVASCRIPT_BANNED),
            // V8 reserves a large virtual address space up front
            memory_limit_enforced: false,
        },
        Language::Cpp => ToolchainSpec {
            language,
            source_extension: "cpp".into(),
            compile: Some(argv(&["g++", "-std=c++17", "-O2", "{source}", "-o", "{artifact}"])),
            run: argv(&["{artifact}"]),
            entry: fixed,
            banned_patterns: patterns(NATIVE_BANNED),
            memory_limit_enforced: true,
        },
        Language::Java => ToolchainSpec {
            language,
            source_extension: "java".into(),
            compile: Some(argv(&["javac", "-d", "{dir}", "{source}"])),
            run: argv(&["java", "-cp", "{dir}", "{entry}"]),
            entry: EntryRule::PublicClass,
            banned_patterns: patterns(&[NATIVE_BANNED, JAVA_BANNED].concat()),
            // The JVM reserves far more virtual memory than it touches
            memory_limit_enforced: false,
        },
        Language::Go => ToolchainSpec {
            language,
            source_extension: "go".into(),
            compile: Some(argv(&["go", "build", "-o", "{artifact}", "{source}"])),
            run: argv(&["{artifact}"]),
            entry: fixed,
            banned_patterns: patterns(GO_BANNED),
            memory_limit_enforced: false,
        },
        Language::Rust => ToolchainSpec {
            language,
            source_extension: "rs".into(),
            compile: Some(argv(&["rustc", "-O", "-o", "{artifact}", "{source}"])),
            run: argv(&["{artifact}"]),
            entry: fixed,
            banned_patterns: patterns(RUST_BANNED),
            memory_limit_enforced: true,
        },
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ToolchainEntry {
    name: String,
    source_extension: String,
    #[serde(default)]
    compile: Option<Vec<String>>,
    run: Vec<String>,
    #[serde(default)]
    entry: EntryRule,
    #[serde(default)]
    banned_patterns: Vec<String>,
    #[serde(default = "default_true")]
    memory_limit_enforced: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<ToolchainEntry>,
}

/// Read-only registry of toolchains keyed by language.
#[derive(Debug, Clone)]
pub struct ToolchainRegistry {
    specs: HashMap<Language, ToolchainSpec>,
}

impl ToolchainRegistry {
    /// Registry with the built-in toolchain for every known language.
    pub fn builtin() -> Self {
        let specs = Language::ALL
            .iter()
            .map(|&lang| (lang, builtin_spec(lang)))
            .collect();
        Self { specs }
    }

    /// Build a registry from explicit specs, validating each one.
    pub fn from_specs(specs: impl IntoIterator<Item = ToolchainSpec>) -> Result<Self> {
        let mut map = HashMap::new();
        for spec in specs {
            spec.validate()?;
            let language = spec.language;
            if map.insert(language, spec).is_some() {
                bail!("Duplicate toolchain for language: {}", language);
            }
        }
        if map.is_empty() {
            bail!("No languages configured");
        }
        Ok(Self { specs: map })
    }

    /// Load toolchains from a languages.json file.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to load {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        let mut specs = Vec::with_capacity(languages_json.languages.len());
        for entry in languages_json.languages {
            let language: Language = entry
                .name
                .parse()
                .map_err(|_| anyhow::anyhow!("Unknown language '{}' in languages.json", entry.name))?;
            specs.push(ToolchainSpec {
                language,
                source_extension: entry.source_extension,
                compile: entry.compile,
                run: entry.run,
                entry: entry.entry,
                banned_patterns: entry.banned_patterns,
                memory_limit_enforced: entry.memory_limit_enforced,
            });
        }
        Self::from_specs(specs)
    }

    pub fn resolve(&self, language: Language) -> JudgeResult<&ToolchainSpec> {
        self.specs
            .get(&language)
            .ok_or_else(|| JudgeError::not_configured(language))
    }

    /// List all configured languages
    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.specs.keys().copied().collect();
        languages.sort_by_key(|l| l.as_str());
        languages
    }
}
