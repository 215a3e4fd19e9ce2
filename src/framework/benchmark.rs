//! Google Benchmark executables.
//!
//! Discovery uses `--benchmark_list_tests=true`, which prints one benchmark
//! name per line. Runs ask for `--benchmark_format=json` and read the
//! `benchmarks` array, one record per benchmark:
//!
//! ```json
//! {
//!   "context": { "executable": "./bench" },
//!   "benchmarks": [
//!     { "name": "BM_Sort/1024", "iterations": 1000,
//!       "real_time": 1520.4, "cpu_time": 1500.0, "time_unit": "us" }
//!   ]
//! }
//! ```
//!
//! A benchmark passes unless it reports `error_occurred` or its primary
//! metric exceeds the configured `fail_if_exceeds_limit_ns`.

use serde_json::{Map, Value};
use tracing::warn;

use super::{
    DiscoveredTest, FrameworkError, FrameworkResult, RunSelection, TestEventBuilder,
    TestFramework, TestTarget,
};
use crate::tree::TestCommit;

/// Metrics in order of preference; the first non-zero one is reported.
const METRIC_KEYS: [&str; 3] = ["cpu_time", "cpu_coefficient", "rms"];

#[derive(Debug, Clone, Copy, Default)]
pub struct BenchmarkFramework;

impl TestFramework for BenchmarkFramework {
    fn list_args(&self) -> Vec<String> {
        vec!["--benchmark_list_tests=true".to_string()]
    }

    fn parse_list(&self, stdout: &str) -> FrameworkResult<Vec<DiscoveredTest>> {
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|name| DiscoveredTest {
                suite_path: Vec::new(),
                label: name.to_string(),
                name: name.to_string(),
                skipped: name.starts_with("DISABLED_"),
                file: None,
                line: None,
            })
            .collect())
    }

    fn run_args(&self, selection: RunSelection<'_>) -> Vec<String> {
        let mut args = vec!["--benchmark_format=json".to_string()];
        if let RunSelection::Subset { names, .. } = selection {
            let escaped: Vec<String> = names.iter().map(|n| regex::escape(n)).collect();
            args.push(format!("--benchmark_filter=^({})$", escaped.join("|")));
        }
        args
    }

    fn parse_run(
        &self,
        stdout: &str,
        targets: &[TestTarget],
    ) -> FrameworkResult<Vec<(String, TestCommit)>> {
        let records = split_output(stdout)?;
        let mut results = Vec::new();
        for (name, record) in records {
            let limit = match targets.iter().find(|t| t.name == name) {
                Some(target) => target.limit_ns,
                None if targets.is_empty() => None,
                // Aggregates such as `BM_x_mean` have no test of their own.
                None => continue,
            };
            if results.iter().any(|(n, _)| n == &name) {
                continue;
            }
            results.push((name, parse_record(&record, limit)));
        }
        Ok(results)
    }
}

/// Extracts the benchmark records, keyed by name, in output order.
pub fn split_output(stdout: &str) -> FrameworkResult<Vec<(String, Map<String, Value>)>> {
    let root: Value = serde_json::from_str(stdout)
        .map_err(|e| FrameworkError::OutputParse(e.to_string()))?;
    let benchmarks = root
        .get("benchmarks")
        .and_then(Value::as_array)
        .ok_or_else(|| FrameworkError::OutputParse("missing \"benchmarks\" array".to_string()))?;

    benchmarks
        .iter()
        .map(|entry| {
            let record = entry.as_object().ok_or_else(|| {
                FrameworkError::OutputParse(format!("benchmark entry is not an object: {}", entry))
            })?;
            let name = record.get("name").and_then(Value::as_str).ok_or_else(|| {
                FrameworkError::OutputParse("benchmark without a name".to_string())
            })?;
            Ok((name.to_string(), record.clone()))
        })
        .collect()
}

/// Multiplier to nanoseconds and display unit for a `time_unit` value.
fn unit_ratio(time_unit: &str) -> (f64, &'static str) {
    match time_unit {
        "ns" => (1.0, "ns"),
        "us" => (1_000.0, "μs"),
        "ms" => (1_000_000.0, "ms"),
        other => {
            warn!("Unknown benchmark time unit {:?}", other);
            (1.0, "?")
        }
    }
}

/// Turns one benchmark record into a result.
pub fn parse_record(record: &Map<String, Value>, limit_ns: Option<f64>) -> TestCommit {
    let mut builder = TestEventBuilder::new();

    if record.get("error_occurred").and_then(Value::as_bool) == Some(true) {
        builder.errored();
        if let Some(message) = record.get("error_message").and_then(Value::as_str) {
            builder.append_message(format!("❌ Error: {}", message));
            builder.append_message(" ");
        }
    }

    let metric = METRIC_KEYS.iter().find_map(|key| {
        let value = record.get(*key)?.as_f64()?;
        (value != 0.0).then_some((*key, value))
    });

    if let Some((key, value)) = metric {
        let time_unit = record.get("time_unit").and_then(Value::as_str).unwrap_or("ns");
        let (ratio, unit) = unit_ratio(time_unit);

        if let Some(limit) = limit_ns
            && value * ratio > limit
        {
            builder.append_message(format!("❌ Failed: \"{}\" exceeded limit: {} ns.", key, limit));
            builder.append_message(" ");
            builder.failed();
        }

        builder.append_description(format!("({:.2}{})", value, unit));
        builder.append_tooltip(format!("⏱{}: {} {}", key, value, unit));
    }

    for (key, value) in record {
        builder.append_message(format!("{}: {}", key, value));
    }

    builder.passed();
    builder.build()
}
