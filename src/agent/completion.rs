//! "Is the AI CLI done answering?" heuristics
//!
//! The wrapped CLI has no structured completion signal, so every strategy
//! here is best-effort: it looks at raw terminal text and how long output has
//! been quiet.

use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Decides whether captured output looks like a finished response
pub trait CompletionHeuristic: Send + Sync {
    fn is_complete(&self, output: &str, quiet_for: Duration) -> bool;

    fn name(&self) -> &'static str;
}

/// Remove ANSI escape sequences from terminal output
pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    let re = ANSI.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[()][0-9A-Za-z]|\x1b[=>]")
            .ok()
    });
    match re {
        Some(re) => re.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

/// Complete when the tail of the output matches a prompt pattern
pub struct PromptPattern {
    patterns: Vec<Regex>,
}

impl PromptPattern {
    /// Invalid patterns are skipped with a warning
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .filter_map(|p| match Regex::new(p.as_ref()) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p.as_ref(), "Ignoring invalid prompt pattern: {}", e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    fn matches(&self, output: &str) -> bool {
        let clean = strip_ansi(output);
        let tail: String = {
            let lines: Vec<&str> = clean.trim_end().lines().collect();
            let start = lines.len().saturating_sub(3);
            lines[start..].join("\n")
        };
        !tail.is_empty() && self.patterns.iter().any(|re| re.is_match(&tail))
    }
}

impl CompletionHeuristic for PromptPattern {
    fn is_complete(&self, output: &str, _quiet_for: Duration) -> bool {
        self.matches(output)
    }

    fn name(&self) -> &'static str {
        "prompt-pattern"
    }
}

/// Complete once output has been quiet for a window
pub struct Stability {
    window: Duration,
}

impl Stability {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }
}

impl CompletionHeuristic for Stability {
    fn is_complete(&self, output: &str, quiet_for: Duration) -> bool {
        !output.is_empty() && quiet_for >= self.window
    }

    fn name(&self) -> &'static str {
        "stability"
    }
}

/// Prompt seen and output briefly settled, or long quiet regardless
pub struct Hybrid {
    pattern: PromptPattern,
    stability: Stability,
    settle: Duration,
}

impl Hybrid {
    pub fn new(pattern: PromptPattern, stability: Stability) -> Self {
        Self {
            pattern,
            stability,
            settle: Duration::from_millis(200),
        }
    }
}

impl CompletionHeuristic for Hybrid {
    fn is_complete(&self, output: &str, quiet_for: Duration) -> bool {
        (quiet_for >= self.settle && self.pattern.matches(output))
            || self.stability.is_complete(output, quiet_for)
    }

    fn name(&self) -> &'static str {
        "hybrid"
    }
}
