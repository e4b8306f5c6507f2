//! Running a whole suite: rebuild the compiler, find the test cases, run or
//! generate each one, and add up the results.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use thiserror::Error;

use crate::compare::{verdict, FailReason, Statistics, Verdict};
use crate::driver::{
    invoke_and_run, Artifact, BuildError, BuildStep, CompilerDriver, DriverError, Execution,
    ReferenceDriver, RunResult, Toolchain,
};
use crate::expect::ExpectationRecord;
use crate::locate::{chapter_roots, Locator, LocatorError, TestCase};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Write expectation files from trusted runs.
    Generate,
    /// Check the compiler against existing expectation files.
    Verify,
}

/// Which tests to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A single source file or a directory tree.
    Path(PathBuf),
    /// `chapter_low` through `chapter_high` under the configured base
    /// directory.  Missing chapters are skipped.
    Chapters { low: u32, high: u32 },
}

pub const DEFAULT_LOW_CHAPTER: u32 = 1;
pub const DEFAULT_HIGH_CHAPTER: u32 = 20;

#[derive(Debug, Clone)]
pub struct Config {
    /// The compiler under test.
    pub compiler: PathBuf,
    /// Reference compiler command line, sources get appended.
    pub reference: String,
    /// How to rebuild the compiler, if it can be rebuilt.
    pub build: Option<BuildStep>,
    /// Extension of test source files.
    pub extension: String,
    /// Limit for each compiler or test program invocation.
    pub timeout: Duration,
    /// Where the `chapter_N` directories are.
    pub chapter_base: PathBuf,
}

impl Default for Config {
    /// Set up to run from the compiler repo's `test` directory, with the
    /// compiler one level up.
    fn default() -> Self {
        let mut compiler = PathBuf::from("..");
        compiler.push(format!("occm{}", std::env::consts::EXE_SUFFIX));
        Self {
            compiler,
            reference: "gcc -O0".to_owned(),
            build: Some(BuildStep::new("odin", vec!["build".into(), ".".into()]).in_dir("..")),
            extension: "c".to_owned(),
            timeout: Duration::from_secs(10),
            chapter_base: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("ABORT: Compiler build failed: {0}")]
    BuildFailed(#[from] BuildError),
    #[error(transparent)]
    Locate(#[from] LocatorError),
    #[error("could not set up reference compiler: {0}")]
    Reference(#[source] io::Error),
}

/// Stops a run from starting any more test cases.  The case in flight
/// finishes normally.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Process exit code for the outcome of a run: 0 if everything passed,
/// 1 if some test failed, 2 if the run couldn't happen at all.
pub fn exit_code(result: &Result<Statistics, RunError>) -> i32 {
    match result {
        Ok(stats) if stats.all_passed() => 0,
        Ok(_) => 1,
        Err(_) => 2,
    }
}

pub struct Orchestrator {
    config: Config,
    compiler: CompilerDriver,
    locator: Locator,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let compiler = CompilerDriver::new(&config.compiler, config.timeout);
        let locator = Locator::new(&config.extension);
        Self {
            config,
            compiler,
            locator,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally controlled cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(&self, target: &Target, mode: Mode, rebuild: bool) -> Result<Statistics, RunError> {
        if rebuild {
            self.rebuild()?;
        }
        let cases = self.locate(target)?;
        if cases.is_empty() {
            info!("No test cases found for {:?}", target);
        }

        let stats = match mode {
            Mode::Verify => self.verify_all(&cases),
            Mode::Generate => {
                let reference =
                    ReferenceDriver::from_command_line(&self.config.reference, self.config.timeout)
                        .map_err(RunError::Reference)?;
                self.generate_all(&cases, &reference)
            }
        };
        println!("{}", stats);
        Ok(stats)
    }

    /// A compiler that doesn't build makes every result meaningless, so
    /// this aborts the whole run.
    fn rebuild(&self) -> Result<(), RunError> {
        match &self.config.build {
            Some(build) => Ok(build.run()?),
            None => {
                warn!("Rebuild requested but no build command is configured");
                Ok(())
            }
        }
    }

    fn locate(&self, target: &Target) -> Result<Vec<TestCase>, LocatorError> {
        match target {
            Target::Path(path) => self.locator.locate(path),
            Target::Chapters { low, high } => {
                let roots = chapter_roots(&self.config.chapter_base, *low, *high)?;
                self.locator.locate_existing(&roots)
            }
        }
    }

    /// False once cancelled, logging how much got left out.
    fn keep_going(&self, remaining: usize) -> bool {
        if self.cancel.is_cancelled() {
            warn!("Run cancelled, {} test case(s) not started", remaining);
            false
        } else {
            true
        }
    }

    fn verify_all(&self, cases: &[TestCase]) -> Statistics {
        let mut stats = Statistics::default();
        for (i, case) in cases.iter().enumerate() {
            if !self.keep_going(cases.len() - i) {
                break;
            }
            print!("Running test {}:  ", case);
            let v = self.verify(case);
            println!("{}", v);
            stats.record(&v);
        }
        stats
    }

    /// Run one test case and judge it.  Never fails as such; anything that
    /// goes wrong is a failed test.
    pub fn verify(&self, case: &TestCase) -> Verdict {
        let expected = match ExpectationRecord::load(&case.expectation_path()) {
            Ok(r) => r,
            Err(e) => return Verdict::Fail(e.into()),
        };
        match self.execute(case) {
            Ok(actual) => verdict(case.category, &actual, &expected),
            Err(reason) => Verdict::Fail(reason),
        }
    }

    /// The result to compare: the test program's for `valid` cases, the
    /// compiler's for everything else.
    fn execute(&self, case: &TestCase) -> Result<RunResult, FailReason> {
        if !case.category.is_valid() {
            return Ok(self.compile_invalid(case)?);
        }
        match invoke_and_run(&self.compiler, &case.source_paths)? {
            Execution::Ran(res) => Ok(res),
            Execution::CompileFailed(res) => Err(FailReason::CompileFailed {
                exit_code: res.exit_code,
                stderr: res.stderr,
            }),
        }
    }

    /// Compile a program that shouldn't compile.  If it does anyway, the
    /// executable it leaves behind gets removed.
    fn compile_invalid(&self, case: &TestCase) -> Result<RunResult, DriverError> {
        let artifact = Artifact::new(self.compiler.artifact_path(case.primary_path()));
        let res = self.compiler.invoke(&case.source_paths)?;
        if artifact.exists() {
            warn!(
                "{} produced {} for an invalid program, removing it",
                self.compiler.name(),
                artifact.path().display()
            );
        }
        Ok(res)
    }

    fn generate_all(&self, cases: &[TestCase], reference: &ReferenceDriver) -> Statistics {
        let mut stats = Statistics::default();
        for (i, case) in cases.iter().enumerate() {
            if !self.keep_going(cases.len() - i) {
                break;
            }
            match self.generate(case, reference) {
                Ok(true) => stats.record(&Verdict::Pass),
                Ok(false) => stats.skip(),
                Err(reason) => {
                    let v = Verdict::Fail(reason);
                    println!("{}: {}", case, v);
                    stats.record(&v);
                }
            }
        }
        stats
    }

    /// Write the expectation file for one case.  `valid` cases are recorded
    /// from the reference compiler's build of the program, the rest from the
    /// compiler under test's own diagnostics.  Returns false if the case
    /// was skipped.
    pub fn generate(
        &self,
        case: &TestCase,
        reference: &ReferenceDriver,
    ) -> Result<bool, FailReason> {
        let run = if case.category.is_valid() {
            match invoke_and_run(reference, &case.source_paths)? {
                Execution::Ran(res) => res,
                Execution::CompileFailed(res) => {
                    // Not every test builds cleanly with the reference
                    // compiler's flags; those just don't get a record.
                    info!(
                        "{} could not compile {}, skipping (exit code {})",
                        reference.name(),
                        case,
                        res.exit_code
                    );
                    return Ok(false);
                }
            }
        } else {
            self.compile_invalid(case)?
        };

        let path = case.expectation_path();
        println!("Generating {}", path.display());
        ExpectationRecord::from_run(&run)
            .save(&path)
            .map_err(|e| FailReason::Driver(e.to_string()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_repo_layout() {
        let config = Config::default();
        assert!(config.compiler.starts_with(".."));
        assert_eq!(config.reference, "gcc -O0");
        assert_eq!(config.extension, "c");
        assert!(config.build.is_some());
    }

    #[test]
    fn exit_codes() {
        let ok = Statistics {
            passed: 3,
            ..Default::default()
        };
        let bad = Statistics {
            passed: 3,
            failed: 1,
            skipped: 0,
        };
        assert_eq!(exit_code(&Ok(ok)), 0);
        assert_eq!(exit_code(&Ok(bad)), 1);
        let err = RunError::Locate(LocatorError::NotFound(PathBuf::from("nope")));
        assert_eq!(exit_code(&Err(err)), 2);
    }

    #[test]
    fn failed_build_aborts_with_one_message() {
        let mut config = Config::default();
        config.build = Some(BuildStep::new("/definitely/not/a/build/tool", vec![]));
        let orch = Orchestrator::new(config);
        let err = orch
            .run(&Target::Path(PathBuf::from(".")), Mode::Verify, true)
            .unwrap_err();
        assert!(matches!(err, RunError::BuildFailed(_)));
        let msg = err.to_string();
        assert!(msg.starts_with("ABORT: Compiler build failed: "));
        assert_eq!(msg.matches("ABORT").count(), 1);
    }

    #[test]
    fn cancel_token_is_shared() {
        let orch = Orchestrator::new(Config::default());
        let token = orch.cancel_token();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(orch.cancel_token().is_cancelled());
    }
}
