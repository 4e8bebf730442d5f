//! Failure extraction from test-runner output
//!
//! Only lines shaped like `FAILED <file>::<test> - <reason>` count. Anything
//! else is noise, including runner output in an unexpected format.

use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;

static FAILED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*FAILED\s+(?P<file>\S+?)::(?P<test>\S+)\s+-\s+(?P<reason>.*?)\s*$")
        .expect("failed-line pattern is valid")
});

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?P<failed>\d+) failed)?(?:, )?(?:(?P<passed>\d+) passed)?")
        .expect("summary pattern is valid")
});

/// One failing test as reported by the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub file: PathBuf,
    pub test: String,
    pub error: String,
}

/// Parse combined stdout/stderr into failure records, in report order.
///
/// No deduplication: a test reported twice yields two records.
pub fn parse(output: &str) -> Vec<FailureRecord> {
    output
        .lines()
        .filter_map(|line| {
            let caps = FAILED_LINE.captures(line)?;
            Some(FailureRecord {
                file: PathBuf::from(&caps["file"]),
                test: caps["test"].to_string(),
                error: caps["reason"].to_string(),
            })
        })
        .collect()
}

/// Pass/fail counts from pytest's closing summary line, if present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub failed: usize,
    pub passed: usize,
}

/// Read the `N failed, M passed` counts from the last summary-looking line.
///
/// Used for logging only.
pub fn summary_line(output: &str) -> Option<RunSummary> {
    output
        .lines()
        .rev()
        .filter(|line| line.contains(" failed") || line.contains(" passed"))
        .find_map(|line| {
            SUMMARY_LINE.captures_iter(line).find_map(|caps| {
                let failed = caps.name("failed").and_then(|m| m.as_str().parse().ok());
                let passed = caps.name("passed").and_then(|m| m.as_str().parse().ok());
                if failed.is_none() && passed.is_none() {
                    return None;
                }
                Some(RunSummary {
                    failed: failed.unwrap_or(0),
                    passed: passed.unwrap_or(0),
                })
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_failure() {
        let output = "FAILED tests/math.py::test_add - AttributeError: 'Calc' object has no attribute 'add'";
        let records = parse(output);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, PathBuf::from("tests/math.py"));
        assert_eq!(records[0].test, "test_add");
        assert_eq!(
            records[0].error,
            "AttributeError: 'Calc' object has no attribute 'add'"
        );
    }

    #[test]
    fn test_parse_keeps_order_and_duplicates() {
        let output = "\
============ short test summary info ============
FAILED tests/a.py::test_one - AssertionError: 1 != 2
some noise line
FAILED tests/b.py::TestThing::test_two[param-1] - ImportError: No module named 'foo'
FAILED tests/a.py::test_one - AssertionError: 1 != 2
======= 3 failed, 10 passed in 0.12s =======";
        let records = parse(output);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].test, "test_one");
        assert_eq!(records[1].file, PathBuf::from("tests/b.py"));
        assert_eq!(records[1].test, "TestThing::test_two[param-1]");
        assert_eq!(records[0], records[2]);
    }

    #[test]
    fn test_parse_ignores_other_formats() {
        let output = "ERROR tests/a.py - collection failed\nFAILED without separator\n";
        assert!(parse(output).is_empty());
        assert!(parse("").is_empty());
    }

    #[test]
    fn test_parse_counts_match_well_formed_lines() {
        let output: String = (0..25)
            .map(|i| format!("FAILED tests/t{i}.py::test_{i} - TypeError: bad {i}\n"))
            .collect();
        let records = parse(&output);
        assert_eq!(records.len(), 25);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.test, format!("test_{i}"));
        }
    }

    #[test]
    fn test_summary_line() {
        let output = "stuff\n======= 3 failed, 10 passed in 0.12s =======\n";
        assert_eq!(
            summary_line(output),
            Some(RunSummary {
                failed: 3,
                passed: 10
            })
        );
        assert_eq!(
            summary_line("==== 4 passed in 1.0s ===="),
            Some(RunSummary {
                failed: 0,
                passed: 4
            })
        );
        assert_eq!(summary_line("nothing here"), None);
    }
}
