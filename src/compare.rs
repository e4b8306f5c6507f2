//! Deciding whether a test case passed.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::category::Category;
use crate::driver::{DriverError, RunResult};
use crate::expect::{encode_bytes_literal, ExpectError, ExpectationRecord};

/// Why a test case failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    ExitCode {
        expected: i32,
        actual: i32,
    },
    /// The compiler didn't fail where the category says it should, or the
    /// recorded expectation itself doesn't describe such a failure.
    StageNotReached(Category),
    Stdout {
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    Stderr {
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
    /// A program that should compile didn't.
    CompileFailed {
        exit_code: i32,
        stderr: Vec<u8>,
    },
    TimedOut {
        program: String,
        after: Duration,
    },
    MissingExpectation(PathBuf),
    BadExpectation(String),
    /// Couldn't run something at all.
    Driver(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::ExitCode { expected, actual } => write!(
                f,
                "exit code mismatch: expected {}, got {}",
                expected, actual
            ),
            FailReason::StageNotReached(category) => write!(
                f,
                "{} succeeded but should have failed at {} stage",
                category.gerund(),
                category.stage()
            ),
            FailReason::Stdout { expected, actual } => write!(
                f,
                "stdout mismatch: expected {}, got {}",
                encode_bytes_literal(expected),
                encode_bytes_literal(actual)
            ),
            FailReason::Stderr { expected, actual } => write!(
                f,
                "stderr mismatch: expected {}, got {}",
                encode_bytes_literal(expected),
                encode_bytes_literal(actual)
            ),
            FailReason::CompileFailed { exit_code, stderr } => {
                write!(f, "compilation failed with exit code {}", exit_code)?;
                let first = String::from_utf8_lossy(stderr);
                match first.lines().next() {
                    Some(line) if !line.trim().is_empty() => write!(f, ": {}", line.trim()),
                    _ => Ok(()),
                }
            }
            FailReason::TimedOut { program, after } => write!(
                f,
                "timed out: `{}` ran longer than {}s",
                program,
                after.as_secs_f64()
            ),
            FailReason::MissingExpectation(path) => {
                write!(f, "no expectation file at {}", path.display())
            }
            FailReason::BadExpectation(msg) => write!(f, "bad expectation file: {}", msg),
            FailReason::Driver(msg) => f.write_str(msg),
        }
    }
}

impl From<DriverError> for FailReason {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::TimedOut { program, after } => FailReason::TimedOut { program, after },
            other => FailReason::Driver(other.to_string()),
        }
    }
}

impl From<ExpectError> for FailReason {
    fn from(e: ExpectError) -> Self {
        let missing = e.is_missing();
        match e {
            ExpectError::Read { path, .. } if missing => FailReason::MissingExpectation(path),
            other => FailReason::BadExpectation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(FailReason),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS!"),
            Verdict::Fail(reason) => write!(f, "FAIL! {}", reason),
        }
    }
}

/// Judge one run against its expectation.
///
/// Checks go exit code, then (for the `invalid_*` categories) that the
/// failure happened at the right stage, then stdout, then stderr.  The first
/// mismatch is the one reported.  Fields missing from the record aren't
/// checked.
pub fn verdict(category: Category, actual: &RunResult, expected: &ExpectationRecord) -> Verdict {
    if let Some(code) = expected.exit_code {
        if code != actual.exit_code {
            return Verdict::Fail(FailReason::ExitCode {
                expected: code,
                actual: actual.exit_code,
            });
        }
    }
    if !failed_at_stage(category, actual, expected) {
        return Verdict::Fail(FailReason::StageNotReached(category));
    }
    if let Some(out) = &expected.stdout {
        if *out != actual.stdout {
            return Verdict::Fail(FailReason::Stdout {
                expected: out.clone(),
                actual: actual.stdout.clone(),
            });
        }
    }
    if let Some(err) = &expected.stderr {
        if *err != actual.stderr {
            return Verdict::Fail(FailReason::Stderr {
                expected: err.clone(),
                actual: actual.stderr.clone(),
            });
        }
    }
    Verdict::Pass
}

/// For an `invalid_*` case: the compiler exited with the stage's exit code
/// and named the stage on stderr, and the record agrees.  A matching exit
/// code alone isn't enough, the compiler could be crashing for some
/// unrelated reason.  Always true for `valid`.
fn failed_at_stage(category: Category, actual: &RunResult, expected: &ExpectationRecord) -> bool {
    let (marker, sentinel) = match (category.marker(), category.failure_exit_code()) {
        (Some(m), Some(code)) => (m.as_bytes(), code),
        _ => return true,
    };
    let record_ok = expected.exit_code != Some(0)
        && expected
            .stderr
            .as_ref()
            .map_or(true, |s| contains(s, marker));
    record_ok && actual.exit_code == sentinel && contains(&actual.stderr, marker)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// Pass/fail counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Statistics {
    pub fn record(&mut self, verdict: &Verdict) {
        if verdict.is_pass() {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn skip(&mut self) {
        self.skipped += 1;
    }

    pub fn merge(&mut self, other: Statistics) {
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passed: {}, Failed: {}", self.passed, self.failed)?;
        if self.skipped > 0 {
            write!(f, ", Skipped: {}", self.skipped)?;
        }
        Ok(())
    }
}
