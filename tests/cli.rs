use assert_cmd::Command;
use predicates::prelude::*;

const GTEST_SCRIPT: &str = r#"
case "$1" in
  --gtest_list_tests)
    printf 'Math.\n  Add\n  DISABLED_Div\nStrings.\n  Split\n'
    exit 0
    ;;
esac
echo "[ RUN      ] Math.Add"
echo "[       OK ] Math.Add (1 ms)"
echo "[ RUN      ] Strings.Split"
if [ -n "$FAIL_SPLIT" ]; then
  echo "strings.cpp:12: Failure"
  echo "[  FAILED  ] Strings.Split (0 ms)"
  exit 1
fi
echo "[       OK ] Strings.Split (0 ms)"
"#;

fn workspace(extra: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("gtest.sh"), GTEST_SCRIPT).unwrap();
    let config = format!(
        r#"
[test]
parallel_execution_limit = 2

[[executables]]
name = "unit"
path = "/bin/sh"
args = ["${{workspaceFolder}}/gtest.sh"]
{}
"#,
        extra
    );
    std::fs::write(dir.path().join("testmate.toml"), config).unwrap();
    dir
}

fn testmate(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("testmate").unwrap();
    cmd.arg("--config").arg(dir.path().join("testmate.toml"));
    cmd
}

#[test]
fn test_validate_prints_settings() {
    let dir = workspace("");
    testmate(&dir)
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Parallel execution limit: 2"))
        .stdout(predicate::str::contains("- unit (gtest)"));
}

#[test]
fn test_validate_rejects_bad_executor_template() {
    let dir = workspace(
        r#"
[executables.executor]
program = "valgrind"
args = ["${argsFlat}"]
"#,
    );
    testmate(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"))
        .stderr(predicate::str::contains("executor template"));
}

#[test]
fn test_validate_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    testmate(&dir)
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[cfg(unix)]
#[test]
fn test_list_text_and_json() {
    let dir = workspace("");
    testmate(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("Discovered 3 tests:"))
        .stdout(predicate::str::contains("DISABLED_Div [disabled]"));

    testmate(&dir)
        .args(["list", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"Strings.Split\""));
}

#[cfg(unix)]
#[test]
fn test_run_passing_tests() {
    let dir = workspace("");
    testmate(&dir)
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("All tests passed!"));
}

#[cfg(unix)]
#[test]
fn test_run_failure_sets_exit_code() {
    let dir = workspace("env = { FAIL_SPLIT = \"1\" }");
    testmate(&dir)
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some tests failed."))
        .stdout(predicate::str::contains("unit: Strings.Split"));
}

#[cfg(unix)]
#[test]
fn test_run_unknown_filter_fails() {
    let dir = workspace("");
    testmate(&dir)
        .args(["run", "--filter", "NoSuchTest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No tests match filter"));
}
