//! Running external programs: the compiler under test, the reference
//! toolchain, the programs they produce, and the build step that makes the
//! compiler in the first place.
//!
//! Everything here blocks.  Each invocation gets a deadline; a child that
//! outlives it is killed and reported as timed out instead of hanging the
//! whole suite.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use tempfile::TempDir;
use thiserror::Error;

/// How often we check whether a child has exited.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What one process invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no source files given")]
    NoSources,
    #[error("could not start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("error waiting on `{program}`: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("could not capture output of `{program}`: {source}")]
    Capture {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` timed out after {}s", .after.as_secs_f64())]
    TimedOut { program: String, after: Duration },
}

impl DriverError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DriverError::TimedOut { .. })
    }
}

/// What to do with a child's stdout and stderr.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Capture {
    /// Collect them into the `RunResult`.
    Piped,
    /// Let them go straight to our own terminal; the `RunResult` streams
    /// are then empty.
    Inherit,
}

/// Run a command to completion or until `timeout` elapses.
pub fn run_process(
    mut cmd: Command,
    capture: Capture,
    timeout: Duration,
) -> Result<RunResult, DriverError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null());
    match capture {
        Capture::Piped => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        Capture::Inherit => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
    }
    debug!("Running {:?}", cmd);
    let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
        program: program.clone(),
        source,
    })?;

    // Drain the pipes while we wait, otherwise a chatty child fills the
    // pipe buffer and blocks forever.
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() < deadline => thread::sleep(POLL_INTERVAL),
            Ok(None) => {
                warn!("`{}` exceeded {:?}, killing it", program, timeout);
                let _ = child.kill();
                let _ = child.wait();
                // The reader threads finish on their own once the pipes close.
                return Err(DriverError::TimedOut {
                    program,
                    after: timeout,
                });
            }
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(DriverError::Wait { program, source });
            }
        }
    };

    // A background process the child left behind can keep the pipes open
    // after the child itself is gone, so the readers share its deadline.
    let stdout = collect_output(&program, stdout, deadline, timeout)?;
    let stderr = collect_output(&program, stderr, deadline, timeout)?;
    let result = RunResult {
        exit_code: exit_code(status),
        stdout,
        stderr,
    };
    trace!("`{}` exited with {}", program, result.exit_code);
    Ok(result)
}

type Output = io::Result<Vec<u8>>;

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Output> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = vec![];
        let res = pipe.read_to_end(&mut buf).map(|_| buf);
        // Nobody is listening any more if we already gave up on this run.
        let _ = tx.send(res);
    });
    rx
}

fn collect_output(
    program: &str,
    reader: Option<Receiver<Output>>,
    deadline: Instant,
    timeout: Duration,
) -> Result<Vec<u8>, DriverError> {
    let reader = match reader {
        Some(r) => r,
        None => return Ok(vec![]),
    };
    // A child that exits right at the deadline still gets a moment for its
    // readers to see EOF.
    let wait = (deadline + POLL_INTERVAL).saturating_duration_since(Instant::now());
    let res = match reader.recv_timeout(wait) {
        Ok(res) => res,
        Err(RecvTimeoutError::Timeout) => {
            warn!(
                "`{}` exited but its output is still held open after {:?}, giving up on it",
                program, timeout
            );
            return Err(DriverError::TimedOut {
                program: program.to_owned(),
                after: timeout,
            });
        }
        Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
            io::ErrorKind::Other,
            "reader thread panicked",
        )),
    };
    res.map_err(|source| DriverError::Capture {
        program: program.to_owned(),
        source,
    })
}

/// Signals become negative exit codes so they can never be mistaken for a
/// recorded success.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|s| -s).unwrap_or(-1))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// An executable produced by a compiler.  Deleted when dropped, so it goes
/// away on every path out of a test case: success, failure, timeout, or
/// the comparison later rejecting its output.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
}

impl Artifact {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// A command that runs this artifact.  A bare file name would get
    /// looked up in `$PATH`, so those get a `./` in front.
    pub fn command(&self) -> Command {
        let bare = self
            .path
            .parent()
            .map_or(true, |p| p.as_os_str().is_empty());
        if self.path.is_relative() && bare {
            Command::new(Path::new(".").join(&self.path))
        } else {
            Command::new(&self.path)
        }
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => trace!("Removed {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}

/// Something that turns source files into an executable.
pub trait Toolchain {
    fn name(&self) -> &str;

    /// Compile `sources` together, producing `artifact_path(sources[0])`
    /// on success.
    fn compile(&self, sources: &[PathBuf]) -> Result<RunResult, DriverError>;

    /// Where the executable for a compilation unit with this primary file
    /// ends up.
    fn artifact_path(&self, primary: &Path) -> PathBuf;

    /// Deadline for running the produced program.
    fn run_timeout(&self) -> Duration;
}

/// Outcome of compiling and then running a test program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// Compilation failed, nothing was run.  Holds the compiler's result.
    CompileFailed(RunResult),
    /// Holds the produced program's result.
    Ran(RunResult),
}

/// Compile, run the result, and clean up the executable no matter what.
pub fn invoke_and_run<T: Toolchain + ?Sized>(
    toolchain: &T,
    sources: &[PathBuf],
) -> Result<Execution, DriverError> {
    let primary = sources.first().ok_or(DriverError::NoSources)?;
    // Take ownership of the artifact path before compiling, so even a
    // half-written executable from a timed out compile gets removed.
    let artifact = Artifact::new(toolchain.artifact_path(primary));
    let compiled = toolchain.compile(sources)?;
    if !compiled.success() {
        debug!(
            "{} failed on {} with exit code {}",
            toolchain.name(),
            primary.display(),
            compiled.exit_code
        );
        return Ok(Execution::CompileFailed(compiled));
    }
    let ran = run_process(artifact.command(), Capture::Piped, toolchain.run_timeout())?;
    Ok(Execution::Ran(ran))
}

/// The compiler being tested.
#[derive(Debug, Clone)]
pub struct CompilerDriver {
    compiler: PathBuf,
    timeout: Duration,
    capture: Capture,
}

impl CompilerDriver {
    pub fn new(compiler: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            compiler: compiler.into(),
            timeout,
            capture: Capture::Piped,
        }
    }

    /// Let the compiler write to our terminal instead of capturing it.
    /// Only useful when nobody needs to look at its diagnostics.
    pub fn inherit_output(mut self) -> Self {
        self.capture = Capture::Inherit;
        self
    }

    pub fn compiler(&self) -> &Path {
        &self.compiler
    }

    /// Compile `sources`; the compiler takes them as positional arguments.
    pub fn invoke(&self, sources: &[PathBuf]) -> Result<RunResult, DriverError> {
        if sources.is_empty() {
            return Err(DriverError::NoSources);
        }
        let mut cmd = Command::new(&self.compiler);
        cmd.args(sources);
        run_process(cmd, self.capture, self.timeout)
    }
}

impl Toolchain for CompilerDriver {
    fn name(&self) -> &str {
        self.compiler
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("compiler")
    }

    fn compile(&self, sources: &[PathBuf]) -> Result<RunResult, DriverError> {
        self.invoke(sources)
    }

    /// The compiler drops its output next to the primary source file.
    fn artifact_path(&self, primary: &Path) -> PathBuf {
        primary.with_extension(std::env::consts::EXE_EXTENSION)
    }

    fn run_timeout(&self) -> Duration {
        self.timeout
    }
}

/// A trusted compiler (gcc, by default) used to produce expectations for
/// programs that should work.  Builds into its own scratch directory so it
/// never touches files next to the sources.
#[derive(Debug)]
pub struct ReferenceDriver {
    program: String,
    args: Vec<String>,
    scratch: TempDir,
    timeout: Duration,
}

impl ReferenceDriver {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> io::Result<Self> {
        Ok(Self {
            program: program.into(),
            args,
            scratch: TempDir::new()?,
            timeout,
        })
    }

    /// Build from a command line like `gcc -O0`.
    pub fn from_command_line(cmdline: &str, timeout: Duration) -> io::Result<Self> {
        let mut words = cmdline.split_whitespace().map(str::to_owned);
        let program = words.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty reference command")
        })?;
        Self::new(program, words.collect(), timeout)
    }
}

impl Toolchain for ReferenceDriver {
    fn name(&self) -> &str {
        &self.program
    }

    fn compile(&self, sources: &[PathBuf]) -> Result<RunResult, DriverError> {
        let primary = sources.first().ok_or(DriverError::NoSources)?;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-o")
            .arg(self.artifact_path(primary))
            .args(sources);
        let res = run_process(cmd, Capture::Piped, self.timeout)?;
        if !res.stderr.is_empty() {
            debug!(
                "{} said: {}",
                self.program,
                String::from_utf8_lossy(&res.stderr).trim_end()
            );
        }
        Ok(res)
    }

    fn artifact_path(&self, primary: &Path) -> PathBuf {
        let mut name = primary
            .file_stem()
            .unwrap_or_else(|| OsStr::new("a"))
            .to_os_string();
        name.push(std::env::consts::EXE_SUFFIX);
        self.scratch.path().join(name)
    }

    fn run_timeout(&self) -> Duration {
        self.timeout
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("could not start build command `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("build command `{program}` failed with {status}")]
    Failed { program: String, status: ExitStatus },
}

/// The command that (re)builds the compiler under test.
#[derive(Debug, Clone)]
pub struct BuildStep {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
}

impl BuildStep {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            dir: None,
        }
    }

    /// Split a command line like `odin build .` on whitespace.
    pub fn from_command_line(cmdline: &str) -> Option<Self> {
        let mut words = cmdline.split_whitespace().map(str::to_owned);
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    /// Run the build from this directory instead of the current one.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Run the build with its output thrown away.  Only the exit status
    /// matters.
    pub fn run(&self) -> Result<(), BuildError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        debug!("Building compiler: {:?}", cmd);
        let status = cmd.status().map_err(|source| BuildError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(BuildError::Failed {
                program: self.program.clone(),
                status,
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn captures_streams_and_exit_code() {
        let res = run_process(sh("printf out; printf err >&2; exit 7"), Capture::Piped, 5 * SECOND)
            .unwrap();
        assert_eq!(res.exit_code, 7);
        assert_eq!(res.stdout, b"out");
        assert_eq!(res.stderr, b"err");
    }

    #[test]
    fn inherited_streams_are_not_captured() {
        let res = run_process(sh("echo hi"), Capture::Inherit, 5 * SECOND).unwrap();
        assert!(res.success());
        assert!(res.stdout.is_empty());
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let res = run_process(
            sh("i=0; while [ $i -lt 20000 ]; do echo xxxxxxxxxxxxxxxx; i=$((i+1)); done"),
            Capture::Piped,
            30 * SECOND,
        )
        .unwrap();
        assert_eq!(res.stdout.len(), 20000 * 17);
    }

    #[test]
    fn hung_child_times_out() {
        let start = Instant::now();
        let err = run_process(sh("exec sleep 10"), Capture::Piped, Duration::from_millis(200))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < 5 * SECOND);
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn background_child_holding_pipes_times_out() {
        let start = Instant::now();
        let err = run_process(
            sh("sleep 6 & echo done"),
            Capture::Piped,
            Duration::from_millis(500),
        )
        .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() < 3 * SECOND);
    }

    #[test]
    fn background_child_with_closed_pipes_is_fine() {
        let res = run_process(
            sh("sleep 6 >/dev/null 2>&1 & echo done"),
            Capture::Piped,
            5 * SECOND,
        )
        .unwrap();
        assert!(res.success());
        assert_eq!(res.stdout, b"done\n");
    }

    #[test]
    fn signals_are_negative() {
        let res = run_process(sh("kill -9 $$"), Capture::Piped, 5 * SECOND).unwrap();
        assert_eq!(res.exit_code, -9);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = run_process(
            Command::new("/definitely/not/a/compiler"),
            Capture::Piped,
            SECOND,
        )
        .unwrap_err();
        assert!(matches!(err, DriverError::Spawn { .. }));
    }

    #[test]
    fn artifact_is_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("prog");
        fs::write(&path, b"").unwrap();
        {
            let artifact = Artifact::new(path.clone());
            assert!(artifact.exists());
        }
        assert!(!path.exists());
        // Dropping one that never existed is fine too.
        drop(Artifact::new(dir.path().join("never")));
    }

    #[test]
    fn bare_artifact_names_are_not_looked_up_in_path() {
        let artifact = Artifact::new(PathBuf::from("ls"));
        assert_eq!(artifact.command().get_program(), OsStr::new("./ls"));
        std::mem::forget(artifact);
    }

    /// Pretends to compile by copying the first source, which is a shell
    /// script, to the artifact path.  Sources without a `#!` line "fail".
    struct CopyToolchain {
        out: PathBuf,
    }

    impl Toolchain for CopyToolchain {
        fn name(&self) -> &str {
            "copy"
        }

        fn compile(&self, sources: &[PathBuf]) -> Result<RunResult, DriverError> {
            let mut cmd = sh(r#"head -c 2 "$0" | grep -q '#!' || exit 1; cp "$0" "$1" && chmod +x "$1""#);
            cmd.arg(&sources[0]).arg(&self.out);
            run_process(cmd, Capture::Piped, 5 * SECOND)
        }

        fn artifact_path(&self, _primary: &Path) -> PathBuf {
            self.out.clone()
        }

        fn run_timeout(&self) -> Duration {
            Duration::from_millis(500)
        }
    }

    #[test]
    fn invoke_and_run_runs_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("add.c");
        fs::write(&src, "#!/bin/sh\necho 3\nexit 5\n").unwrap();
        let tc = CopyToolchain {
            out: dir.path().join("add"),
        };
        let res = invoke_and_run(&tc, &[src]).unwrap();
        assert_eq!(
            res,
            Execution::Ran(RunResult {
                exit_code: 5,
                stdout: b"3\n".to_vec(),
                stderr: vec![],
            })
        );
        assert!(!tc.out.exists());
    }

    #[test]
    fn invoke_and_run_stops_on_compile_failure() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("bad.c");
        fs::write(&src, "int main(void) {").unwrap();
        let tc = CopyToolchain {
            out: dir.path().join("bad"),
        };
        match invoke_and_run(&tc, &[src]).unwrap() {
            Execution::CompileFailed(res) => assert_eq!(res.exit_code, 1),
            other => panic!("expected compile failure, got {:?}", other),
        }
    }

    #[test]
    fn invoke_and_run_cleans_up_after_timeout() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("loop.c");
        fs::write(&src, "#!/bin/sh\nexec sleep 10\n").unwrap();
        let tc = CopyToolchain {
            out: dir.path().join("loop"),
        };
        let err = invoke_and_run(&tc, &[src]).unwrap_err();
        assert!(err.is_timeout());
        assert!(!tc.out.exists());
    }

    #[test]
    fn invoke_needs_sources() {
        let driver = CompilerDriver::new("/bin/true", SECOND);
        assert!(matches!(driver.invoke(&[]), Err(DriverError::NoSources)));
    }

    #[test]
    fn compiler_output_can_be_inherited() {
        let driver = CompilerDriver::new("/bin/echo", 5 * SECOND).inherit_output();
        let res = driver.invoke(&[PathBuf::from("hello.c")]).unwrap();
        assert!(res.success());
        assert!(res.stdout.is_empty());

        let driver = CompilerDriver::new("/bin/echo", 5 * SECOND);
        let res = driver.invoke(&[PathBuf::from("hello.c")]).unwrap();
        assert_eq!(res.stdout, b"hello.c\n");
    }

    #[test]
    fn compiler_artifact_sits_next_to_source() {
        let driver = CompilerDriver::new("../occm", SECOND);
        let expected = PathBuf::from("chapter_1/valid/return_2")
            .with_extension(std::env::consts::EXE_EXTENSION);
        assert_eq!(
            driver.artifact_path(Path::new("chapter_1/valid/return_2.c")),
            expected
        );
        assert_eq!(driver.name(), "occm");
    }

    #[test]
    fn reference_artifacts_live_in_scratch() {
        let reference = ReferenceDriver::from_command_line("gcc -O0", SECOND).unwrap();
        let artifact = reference.artifact_path(Path::new("chapter_1/valid/return_2.c"));
        assert!(artifact.starts_with(reference.scratch.path()));
        assert_eq!(reference.args, vec!["-O0".to_owned()]);
        assert!(ReferenceDriver::from_command_line("   ", SECOND).is_err());
    }

    #[test]
    fn build_step_reports_failure() {
        assert!(BuildStep::new("/bin/sh", vec!["-c".into(), "exit 0".into()])
            .run()
            .is_ok());
        let err = BuildStep::new("/bin/sh", vec!["-c".into(), "exit 3".into()])
            .run()
            .unwrap_err();
        assert!(matches!(err, BuildError::Failed { .. }));
        let err = BuildStep::from_command_line("/no/such/build tool")
            .unwrap()
            .run()
            .unwrap_err();
        assert!(matches!(err, BuildError::Spawn { .. }));
    }

    #[test]
    fn build_step_runs_in_dir() {
        let dir = TempDir::new().unwrap();
        BuildStep::new("/bin/sh", vec!["-c".into(), "touch built".into()])
            .in_dir(dir.path())
            .run()
            .unwrap();
        assert!(dir.path().join("built").exists());
    }
}
