//! Accumulates the outcome of one test within one invocation.
//!
//! Parsers feed a [`TestEventBuilder`] with whatever they find in the output
//! and finish with [`TestEventBuilder::build`], which consumes the builder
//! and yields the [`TestCommit`] that is applied to the tree.
//!
//! State precedence: `errored` beats `failed` beats `passed`. `passed` only
//! takes effect when nothing else was reported and `skipped` yields to
//! `errored`.

use std::path::Path;
use std::time::Duration;

use tracing::error;

use crate::format::{duration_seconds, format_duration, normalize_path};
use crate::tree::{Decoration, TestCommit, TestOutcome};

const MAX_DECORATION_MESSAGE: usize = 200;

fn hover_separator() -> String {
    format!("\n{}\n", "⎯".repeat(80))
}

#[derive(Debug, Default)]
pub struct TestEventBuilder {
    outcome: Option<TestOutcome>,
    duration: Option<Duration>,
    message: Vec<String>,
    message_override: Option<String>,
    description: Vec<String>,
    tooltip: Vec<String>,
    decorations: Vec<Decoration>,
}

impl TestEventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn passed(&mut self) -> &mut Self {
        if self.outcome.is_none() {
            self.outcome = Some(TestOutcome::Passed);
        }
        self
    }

    pub fn failed(&mut self) -> &mut Self {
        if self.outcome != Some(TestOutcome::Errored) {
            self.outcome = Some(TestOutcome::Failed);
        }
        self
    }

    pub fn errored(&mut self) -> &mut Self {
        self.outcome = Some(TestOutcome::Errored);
        self
    }

    pub fn skipped(&mut self) -> &mut Self {
        if self.outcome != Some(TestOutcome::Errored) {
            self.outcome = Some(TestOutcome::Skipped);
        }
        self
    }

    pub fn outcome(&self) -> Option<TestOutcome> {
        self.outcome
    }

    pub fn set_duration(&mut self, duration: Duration) -> &mut Self {
        self.duration = Some(duration);
        self
    }

    pub fn append_message(&mut self, line: impl Into<String>) -> &mut Self {
        self.message.push(line.into());
        self
    }

    pub fn append_message_lines<I, S>(&mut self, lines: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Replaces the accumulated message lines (the duration line stays).
    pub fn set_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message_override = Some(message.into());
        self
    }

    pub fn append_description(&mut self, fragment: impl Into<String>) -> &mut Self {
        self.description.push(fragment.into());
        self
    }

    pub fn append_tooltip(&mut self, fragment: impl Into<String>) -> &mut Self {
        self.tooltip.push(fragment.into());
        self
    }

    /// Adds a failure annotation. A second one at the same file and line
    /// turns into a combined `multiple failures` annotation.
    pub fn append_decorator(&mut self, file: &str, line: u32, lines: &[String]) -> &mut Self {
        let file = normalize_path(Path::new(file)).to_string_lossy().into_owned();
        let hover = lines.join("\n");

        if let Some(existing) = self
            .decorations
            .iter_mut()
            .find(|d| d.file == file && d.line == line)
        {
            existing.message = "⬅ multiple failures".to_string();
            existing.hover = format!("{}{}{}", existing.hover, hover_separator(), hover);
            return self;
        }

        let summary = lines
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join("; ");
        let message = if summary.is_empty() {
            "⬅ failed".to_string()
        } else {
            format!("⬅ {}", truncate(&summary, MAX_DECORATION_MESSAGE))
        };

        self.decorations.push(Decoration {
            file,
            line,
            message,
            hover,
        });
        self
    }

    pub fn build(self) -> TestCommit {
        debug_assert!(
            self.outcome.is_some(),
            "TestEventBuilder::build called without a terminal state"
        );
        let outcome = self.outcome.unwrap_or_else(|| {
            error!("Test result built without a terminal state; reporting as errored");
            TestOutcome::Errored
        });

        let mut description = Vec::new();
        let mut message = Vec::new();
        let mut tooltip = self.tooltip;
        if let Some(duration) = self.duration {
            description.push(format!("({})", format_duration(duration)));
            message.push(format!("⏱Duration: {} second(s).", duration_seconds(duration)));
            tooltip.push(format!("⏱Duration: {}", format_duration(duration)));
        }
        description.extend(self.description);
        match self.message_override {
            Some(text) => message.push(text),
            None => message.extend(self.message),
        }

        TestCommit {
            outcome,
            description: non_empty(description.join(" ")),
            tooltip: non_empty(tooltip.join("\n")),
            message: non_empty(message.join("\n")),
            decorations: self.decorations,
            duration: self.duration,
        }
    }

    /// Result for every test of an invocation that ran out of time.
    pub fn timed_out(limit: Duration) -> TestCommit {
        let mut builder = Self::new();
        builder
            .errored()
            .append_description("⌛️ Timed out")
            .append_message(format!(
                "⌛️ Timed out: the run exceeded its limit of {}.",
                format_duration(limit)
            ));
        builder.build()
    }

    /// An `Errored` result with an explanation and optional raw output.
    pub fn errored_with(message: impl Into<String>, output: &str) -> TestCommit {
        let mut builder = Self::new();
        builder.errored().append_message(message);
        if !output.trim().is_empty() {
            builder.append_message_lines(output.lines());
        }
        builder.build()
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_state_precedence() {
        let mut b = TestEventBuilder::new();
        b.failed().passed();
        assert_eq!(b.outcome(), Some(TestOutcome::Failed));
        b.errored().failed().skipped().passed();
        assert_eq!(b.outcome(), Some(TestOutcome::Errored));

        let mut b = TestEventBuilder::new();
        b.passed().failed();
        assert_eq!(b.build().outcome, TestOutcome::Failed);

        let mut b = TestEventBuilder::new();
        b.skipped();
        assert_eq!(b.build().outcome, TestOutcome::Skipped);
    }

    #[test]
    fn test_commit_formatting() {
        let mut b = TestEventBuilder::new();
        b.passed()
            .set_duration(Duration::from_millis(1250))
            .append_description("[x2]")
            .append_tooltip("Iterations: 2")
            .append_message("first line")
            .append_message("second line");
        let commit = b.build();

        assert_eq!(commit.description.as_deref(), Some("(1s 250ms) [x2]"));
        assert_eq!(
            commit.message.as_deref(),
            Some("⏱Duration: 1.25 second(s).\nfirst line\nsecond line")
        );
        assert_eq!(
            commit.tooltip.as_deref(),
            Some("Iterations: 2\n⏱Duration: 1s 250ms")
        );
        assert_eq!(commit.duration, Some(Duration::from_millis(1250)));
    }

    #[test]
    fn test_message_override_and_empty_fields() {
        let mut b = TestEventBuilder::new();
        b.failed()
            .append_message("dropped")
            .set_message("replacement");
        let commit = b.build();
        assert_eq!(commit.message.as_deref(), Some("replacement"));
        assert_eq!(commit.description, None);
        assert_eq!(commit.tooltip, None);
    }

    #[test]
    fn test_decorations_coalesce_at_same_location() {
        let mut b = TestEventBuilder::new();
        b.failed()
            .append_decorator("./src/a.cpp", 10, &lines(&["Expected: 1", "  Actual: 2"]))
            .append_decorator("src/a.cpp", 10, &lines(&["Value of: ok"]))
            .append_decorator("src/a.cpp", 12, &[]);
        let commit = b.build();

        assert_eq!(commit.decorations.len(), 2);
        let first = &commit.decorations[0];
        assert_eq!(first.file, "src/a.cpp");
        assert_eq!(first.message, "⬅ multiple failures");
        assert_eq!(
            first.hover,
            format!("Expected: 1\n  Actual: 2\n{}\nValue of: ok", "⎯".repeat(80))
        );
        assert_eq!(commit.decorations[1].message, "⬅ failed");
    }

    #[test]
    fn test_first_decoration_message() {
        let mut b = TestEventBuilder::new();
        let long = "x".repeat(300);
        b.failed()
            .append_decorator("a.cpp", 1, &lines(&["  Expected: 1 ", "", " Actual: 2"]))
            .append_decorator("b.cpp", 1, &[long]);
        let commit = b.build();
        assert_eq!(commit.decorations[0].message, "⬅ Expected: 1; Actual: 2");
        assert_eq!(
            commit.decorations[1].message.chars().count(),
            "⬅ ".chars().count() + 200 + 1
        );
    }

    #[test]
    fn test_timeout_and_error_helpers() {
        let commit = TestEventBuilder::timed_out(Duration::from_secs(30));
        assert_eq!(commit.outcome, TestOutcome::Errored);
        assert_eq!(commit.description.as_deref(), Some("⌛️ Timed out"));
        assert!(commit.message.unwrap().contains("30s"));

        let commit = TestEventBuilder::errored_with("boom", "line 1\nline 2\n");
        assert_eq!(commit.message.as_deref(), Some("boom\nline 1\nline 2"));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "without a terminal state")]
    fn test_build_without_state_panics_in_debug() {
        TestEventBuilder::new().build();
    }
}
