//! GoogleTest executables.
//!
//! # Discovery
//!
//! `--gtest_list_tests` prints fixtures flush left (ending in `.`) and their
//! tests indented below. Typed and parameterized tests carry a trailing
//! `# TypeParam = ...` / `# GetParam() = ...` comment, which is dropped:
//!
//! ```text
//! MathTest.
//!   Add
//!   DISABLED_Div
//! Typed/0.  # TypeParam = int
//!   Sum
//! ```
//!
//! # Results
//!
//! Run output is cut into one section per `[ RUN      ]` marker. The
//! section's end marker decides the state; failure lines inside it become
//! decorations:
//!
//! ```text
//! [ RUN      ] MathTest.Sub
//! math_test.cpp:12: Failure
//! Expected equality of these values:
//!   1
//!   2
//! [  FAILED  ] MathTest.Sub (0 ms)
//! ```
//!
//! A section that never reaches its end marker belongs to a test that
//! crashed the executable.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{
    DiscoveredTest, FrameworkResult, RunSelection, TestEventBuilder, TestFramework, TestTarget,
};
use crate::format::reindent_lines;
use crate::tree::TestCommit;

const DISABLED_PREFIX: &str = "DISABLED_";

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid regex {pattern}: {e}"))
}

static RUN_RE: LazyLock<Regex> = LazyLock::new(|| compile(r"^\[ RUN      \] (.+)$"));
static END_RE: LazyLock<Regex> =
    LazyLock::new(|| compile(r"^\[ +(OK|FAILED|SKIPPED) +\] (.+?)(?: \((\d+) ms\))?$"));
static FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile(r"^((.+)[:\(]([0-9]+)\)?): ((Failure|EXPECT_CALL|error: )(.*))$")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleTestFramework;

impl TestFramework for GoogleTestFramework {
    fn list_args(&self) -> Vec<String> {
        vec!["--gtest_list_tests".to_string()]
    }

    fn parse_list(&self, stdout: &str) -> FrameworkResult<Vec<DiscoveredTest>> {
        Ok(parse_list(stdout))
    }

    fn run_args(&self, selection: RunSelection<'_>) -> Vec<String> {
        let mut args = vec!["--gtest_color=no".to_string()];
        if let RunSelection::Subset {
            names,
            include_disabled,
        } = selection
        {
            args.push(format!("--gtest_filter={}", names.join(":")));
            if include_disabled {
                args.push("--gtest_also_run_disabled_tests".to_string());
            }
        }
        args
    }

    fn parse_run(
        &self,
        stdout: &str,
        targets: &[TestTarget],
    ) -> FrameworkResult<Vec<(String, TestCommit)>> {
        let wanted = |name: &str| targets.is_empty() || targets.iter().any(|t| t.name == name);
        Ok(split_sections(stdout)
            .into_iter()
            .filter(|s| wanted(&s.name))
            .map(|s| {
                let commit = parse_section(&s);
                (s.name, commit)
            })
            .collect())
    }
}

/// Parses `--gtest_list_tests` output.
pub fn parse_list(stdout: &str) -> Vec<DiscoveredTest> {
    let mut tests = Vec::new();
    let mut fixture: Option<String> = None;

    for raw in stdout.lines() {
        let line = strip_comment(raw);
        if line.trim().is_empty() {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');
        let trimmed = line.trim();

        if !indented {
            // Anything flush left that is not a fixture (log noise) resets it.
            fixture = trimmed.strip_suffix('.').map(str::to_string);
            continue;
        }
        let Some(fixture) = &fixture else {
            continue;
        };
        let skipped = trimmed.starts_with(DISABLED_PREFIX)
            || fixture
                .rsplit('/')
                .any(|part| part.starts_with(DISABLED_PREFIX));
        tests.push(DiscoveredTest {
            suite_path: vec![fixture.clone()],
            label: trimmed.to_string(),
            name: format!("{}.{}", fixture, trimmed),
            skipped,
            file: None,
            line: None,
        });
    }
    tests
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => line[..idx].trim_end(),
        None => line.trim_end(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndMarker {
    Ok,
    Failed,
    Skipped,
}

/// Output of one test between its `[ RUN      ]` and end markers.
#[derive(Debug, Clone)]
struct Section {
    name: String,
    lines: Vec<String>,
    end: Option<(EndMarker, Option<Duration>)>,
}

fn split_sections(stdout: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current: Option<Section> = None;

    for line in stdout.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(caps) = RUN_RE.captures(line) {
            if let Some(unfinished) = current.take() {
                sections.push(unfinished);
            }
            current = Some(Section {
                name: caps[1].trim().to_string(),
                lines: Vec::new(),
                end: None,
            });
            continue;
        }

        let Some(section) = current.as_mut() else {
            continue;
        };
        if let Some(caps) = END_RE.captures(line)
            && caps[2].starts_with(section.name.as_str())
        {
            let marker = match &caps[1] {
                "OK" => EndMarker::Ok,
                "FAILED" => EndMarker::Failed,
                _ => EndMarker::Skipped,
            };
            let duration = caps
                .get(3)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .map(Duration::from_millis);
            section.end = Some((marker, duration));
            if let Some(done) = current.take() {
                sections.push(done);
            }
            continue;
        }
        section.lines.push(line.to_string());
    }

    if let Some(unfinished) = current {
        sections.push(unfinished);
    }
    sections
}

fn parse_section(section: &Section) -> TestCommit {
    let mut builder = TestEventBuilder::new();

    let mut i = 0;
    while i < section.lines.len() {
        let Some(caps) = FAILURE_RE.captures(&section.lines[i]) else {
            i += 1;
            continue;
        };
        let file = caps[2].to_string();
        let line: u32 = caps[3].parse().unwrap_or(0);
        let mut body = vec![caps[4].to_string()];

        i += 1;
        while i < section.lines.len() {
            let next = &section.lines[i];
            if next.trim().is_empty() || FAILURE_RE.is_match(next) {
                break;
            }
            body.push(next.clone());
            i += 1;
        }
        builder.append_decorator(&file, line, &body);
    }

    let shown: Vec<&str> = section
        .lines
        .iter()
        .map(String::as_str)
        .filter(|l| !l.trim().is_empty())
        .collect();
    builder.append_message_lines(reindent_lines(0, &shown));

    match section.end {
        Some((marker, duration)) => {
            if let Some(duration) = duration {
                builder.set_duration(duration);
            }
            match marker {
                EndMarker::Ok => builder.passed(),
                EndMarker::Failed => builder.failed(),
                EndMarker::Skipped => builder.skipped(),
            };
        }
        None => {
            builder
                .errored()
                .append_message("❗️ The test did not finish: it crashed or was killed.");
        }
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::TestOutcome;

    const LIST: &str = "\
Running main() from gtest_main.cc
MathTest.
  Add
  DISABLED_Div
Typed/0.  # TypeParam = int
  Sum
DISABLED_Slow.
  Everything
Param/Inst.
  Case/0  # GetParam() = 1
";

    const RUN: &str = "\
Running main() from gtest_main.cc
[==========] Running 3 tests from 1 test suite.
[ RUN      ] MathTest.Add
[       OK ] MathTest.Add (3 ms)
[ RUN      ] MathTest.Sub
math_test.cpp:12: Failure
Expected equality of these values:
  1
  2

math_test.cpp:12: Failure
Value of: false
[  FAILED  ] MathTest.Sub (1 ms)
[ RUN      ] MathTest.Todo
[  SKIPPED ] MathTest.Todo (0 ms)
[==========] 3 tests from 1 test suite ran. (5 ms total)
[  FAILED  ] 1 test, listed below:
[  FAILED  ] MathTest.Sub
";

    fn run(stdout: &str) -> Vec<(String, TestCommit)> {
        GoogleTestFramework.parse_run(stdout, &[]).unwrap()
    }

    #[test]
    fn test_parse_list() {
        let tests = parse_list(LIST);
        let names: Vec<&str> = tests.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "MathTest.Add",
                "MathTest.DISABLED_Div",
                "Typed/0.Sum",
                "DISABLED_Slow.Everything",
                "Param/Inst.Case/0",
            ]
        );
        assert!(!tests[0].skipped);
        assert!(tests[1].skipped);
        assert!(tests[3].skipped);
        assert_eq!(tests[2].suite_path, vec!["Typed/0"]);
        assert_eq!(tests[4].label, "Case/0");
    }

    #[test]
    fn test_run_args() {
        let names = vec!["A.x".to_string(), "B.y".to_string()];
        assert_eq!(GoogleTestFramework.run_args(RunSelection::All), vec!["--gtest_color=no"]);
        assert_eq!(
            GoogleTestFramework.run_args(RunSelection::Subset {
                names: &names,
                include_disabled: true
            }),
            vec![
                "--gtest_color=no",
                "--gtest_filter=A.x:B.y",
                "--gtest_also_run_disabled_tests"
            ]
        );
    }

    #[test]
    fn test_parse_run_states() {
        let results = run(RUN);
        assert_eq!(results.len(), 3);

        let (name, add) = &results[0];
        assert_eq!(name, "MathTest.Add");
        assert_eq!(add.outcome, TestOutcome::Passed);
        assert_eq!(add.duration, Some(Duration::from_millis(3)));
        assert_eq!(add.description.as_deref(), Some("(3ms)"));

        let (_, sub) = &results[1];
        assert_eq!(sub.outcome, TestOutcome::Failed);
        assert_eq!(sub.decorations.len(), 1);
        assert_eq!(sub.decorations[0].file, "math_test.cpp");
        assert_eq!(sub.decorations[0].line, 12);
        assert_eq!(sub.decorations[0].message, "⬅ multiple failures");
        assert!(sub.decorations[0].hover.contains("Value of: false"));
        assert!(sub.message.as_deref().unwrap().contains("Expected equality"));

        assert_eq!(results[2].1.outcome, TestOutcome::Skipped);
    }

    #[test]
    fn test_single_failure_decoration_text() {
        let out = "\
[ RUN      ] S.T
/src/s.cpp(7): error: Value of: x
  Actual: false
[  FAILED  ] S.T (0 ms)
";
        let results = run(out);
        let deco = &results[0].1.decorations[0];
        assert_eq!(deco.file, "/src/s.cpp");
        assert_eq!(deco.line, 7);
        assert_eq!(deco.message, "⬅ error: Value of: x; Actual: false");
        assert_eq!(deco.hover, "error: Value of: x\n  Actual: false");
    }

    #[test]
    fn test_crashed_section_is_errored() {
        let out = "\
[ RUN      ] S.Ok
[       OK ] S.Ok (0 ms)
[ RUN      ] S.Crash
about to dereference null
";
        let results = run(out);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].0, "S.Crash");
        assert_eq!(results[1].1.outcome, TestOutcome::Errored);
        assert!(results[1].1.message.as_deref().unwrap().contains("about to dereference"));
    }

    #[test]
    fn test_parse_run_filters_targets() {
        let targets = vec![TestTarget {
            name: "MathTest.Todo".to_string(),
            limit_ns: None,
        }];
        let results = GoogleTestFramework.parse_run(RUN, &targets).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "MathTest.Todo");
    }
}
