//! Small text helpers shared by the tree model and the output parsers.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Formats a duration as `1m 2s 30ms`, dropping zero components.
///
/// A zero duration renders as `0ms`.
pub fn format_duration(duration: Duration) -> String {
    let total_ms = duration.as_secs_f64() * 1000.0;
    let minutes = (total_ms / 60_000.0).floor();
    let seconds = ((total_ms - minutes * 60_000.0) / 1000.0).floor();
    let millis = (total_ms - minutes * 60_000.0 - seconds * 1000.0).round();

    let parts: Vec<String> = [(minutes, "m"), (seconds, "s"), (millis, "ms")]
        .into_iter()
        .filter(|(value, _)| *value > 0.0)
        .map(|(value, unit)| format!("{}{}", value as u64, unit))
        .collect();

    if parts.is_empty() {
        "0ms".to_string()
    } else {
        parts.join(" ")
    }
}

/// Seconds with microsecond precision, as printed in test messages.
pub fn duration_seconds(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1_000_000.0).round() / 1_000_000.0
}

/// Strips the common leading indentation of `lines` and re-indents them by
/// `indent` spaces. Blank lines are kept but not indented.
pub fn reindent_lines<S: AsRef<str>>(indent: usize, lines: &[S]) -> Vec<String> {
    let common = lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let prefix = " ".repeat(indent);
    lines
        .iter()
        .map(AsRef::as_ref)
        .map(|l| {
            if l.trim().is_empty() {
                String::new()
            } else {
                format!("{}{}", prefix, l[common..].trim_end())
            }
        })
        .collect()
}

/// [`reindent_lines`] over the lines of a single string.
pub fn reindent_str(indent: usize, text: &str) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    reindent_lines(indent, &lines)
}

/// Lexically normalizes a path: removes `.` components and folds `..` where
/// possible. Does not touch the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    out.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    out.pop();
                } else if !matches!(
                    out.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_))
                ) {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::ZERO), "0ms");
        assert_eq!(format_duration(Duration::from_millis(12)), "12ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s 500ms");
        assert_eq!(format_duration(Duration::from_millis(62_030)), "1m 2s 30ms");
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
    }

    #[test]
    fn test_duration_seconds() {
        assert_eq!(duration_seconds(Duration::from_millis(1234)), 1.234);
        assert_eq!(duration_seconds(Duration::from_micros(1)), 0.000001);
    }

    #[test]
    fn test_reindent_strips_common_prefix() {
        let lines = reindent_str(2, "    a\n      b\n\n    c");
        assert_eq!(lines, vec!["  a", "    b", "", "  c"]);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Path::new("src/./a/../b.cpp")), PathBuf::from("src/b.cpp"));
        assert_eq!(normalize_path(Path::new("../x.cpp")), PathBuf::from("../x.cpp"));
        assert_eq!(normalize_path(Path::new("/a/../../b")), PathBuf::from("/b"));
        assert_eq!(normalize_path(Path::new("./")), PathBuf::from("."));
    }
}
