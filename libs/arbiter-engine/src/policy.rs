// Source policy applied before any workspace is touched.
use crate::toolchain::ToolchainSpec;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    TooLong { chars: usize, limit: usize },
    Disallowed(String),
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::TooLong { chars, limit } => write!(
                f,
                "Source code is {} characters, exceeding the limit of {}",
                chars, limit
            ),
            PolicyViolation::Disallowed(pattern) => {
                write!(f, "Disallowed construct: {}", pattern)
            }
        }
    }
}

/// Strip NUL and non-printing control characters, keeping tab, CR and LF.
pub fn strip_control_chars(source: &str) -> String {
    source
        .chars()
        .filter(|&c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect()
}

/// Check `source` against the size bound and the toolchain's banned
/// patterns, returning the cleaned source on success.
pub fn check_source(
    source: &str,
    toolchain: &ToolchainSpec,
    max_chars: usize,
) -> Result<String, PolicyViolation> {
    let chars = source.chars().count();
    if chars > max_chars {
        return Err(PolicyViolation::TooLong {
            chars,
            limit: max_chars,
        });
    }

    let cleaned = strip_control_chars(source);
    let lowered = cleaned.to_lowercase();
    if let Some(pattern) = toolchain
        .banned_patterns
        .iter()
        .find(|p| lowered.contains(&p.to_lowercase()))
    {
        return Err(PolicyViolation::Disallowed(pattern.clone()));
    }

    Ok(cleaned)
}
