//! Classification of remote stderr as fatal
//!
//! A command that exits successfully can still have failed to reach the
//! database it was meant to restore into. Those failures show up as
//! connectivity messages on stderr and are matched as plain substrings.

/// Built-in fatal connectivity messages
pub const CRITICAL_ERROR_PATTERNS: &[&str] = &[
    "could not connect to server",
    "could not translate host name",
    "Connection timed out",
    "No route to host",
    "Name or service not known",
];

/// Matches stderr against the built-in patterns plus configured extras
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CriticalErrorClassifier {
    extra_patterns: Vec<String>,
}

impl CriticalErrorClassifier {
    /// Classifier over the built-in patterns only
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifier over the built-in patterns and `patterns`
    ///
    /// Blank patterns are ignored, they would match everything.
    pub fn with_extra_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extra_patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.trim().is_empty())
                .collect(),
        }
    }

    /// Whether `stderr` is non-blank and contains a fatal pattern
    pub fn is_critical(&self, stderr: Option<&str>) -> bool {
        self.matched_pattern(stderr).is_some()
    }

    /// The first pattern contained in `stderr`
    pub fn matched_pattern(&self, stderr: Option<&str>) -> Option<&str> {
        let stderr = stderr.filter(|s| !s.trim().is_empty())?;

        CRITICAL_ERROR_PATTERNS
            .iter()
            .copied()
            .chain(self.extra_patterns.iter().map(String::as_str))
            .find(|pattern| stderr.contains(pattern))
    }
}

/// [`CriticalErrorClassifier::is_critical`] over the built-in patterns
pub fn is_critical(stderr: Option<&str>) -> bool {
    CriticalErrorClassifier::new().is_critical(stderr)
}
