//! The test runner program.

use std::path::PathBuf;
use std::time::Duration;

use argh::FromArgs;
use log::error;

use goldcheck::driver::BuildStep;
use goldcheck::orchestrate::{self, DEFAULT_HIGH_CHAPTER, DEFAULT_LOW_CHAPTER};
use goldcheck::{Config, Mode, Orchestrator, Target};

/// Run the compiler test suite, or generate its expectation files.
#[derive(Debug, FromArgs)]
struct Opt {
    /// test file or directory to run; defaults to the chapter range
    #[argh(option, short = 'p')]
    path: Option<PathBuf>,

    /// first chapter to run when no path is given
    #[argh(option)]
    low: Option<u32>,

    /// last chapter to run when no path is given
    #[argh(option)]
    high: Option<u32>,

    /// don't rebuild the compiler first
    #[argh(switch, short = 'n')]
    no_rebuild: bool,

    /// write expectation files instead of checking them
    #[argh(switch, short = 'g')]
    generate: bool,

    /// path of the compiler under test
    #[argh(option)]
    compiler: Option<PathBuf>,

    /// reference compiler command used to generate expectations for valid programs
    #[argh(option)]
    reference: Option<String>,

    /// command that rebuilds the compiler
    #[argh(option)]
    build: Option<String>,

    /// directory to run the build command in
    #[argh(option)]
    build_dir: Option<PathBuf>,

    /// seconds each compile or test program may run before it's killed
    #[argh(option)]
    timeout: Option<u64>,

    /// extension of test source files
    #[argh(option)]
    extension: Option<String>,
}

impl Opt {
    fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(compiler) = &self.compiler {
            config.compiler = compiler.clone();
        }
        if let Some(reference) = &self.reference {
            config.reference = reference.clone();
        }
        if let Some(build) = &self.build {
            config.build = BuildStep::from_command_line(build);
        }
        if let Some(dir) = &self.build_dir {
            config.build = config.build.map(|b| b.in_dir(dir));
        }
        if let Some(secs) = self.timeout {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(ext) = &self.extension {
            config.extension = ext.trim_start_matches('.').to_owned();
        }
        config
    }

    fn target(&self) -> Target {
        match &self.path {
            Some(path) => Target::Path(path.clone()),
            None => Target::Chapters {
                low: self.low.unwrap_or(DEFAULT_LOW_CHAPTER),
                high: self.high.unwrap_or(DEFAULT_HIGH_CHAPTER),
            },
        }
    }
}

fn main() {
    pretty_env_logger::init();
    let opt: Opt = argh::from_env();

    let mode = if opt.generate {
        Mode::Generate
    } else {
        Mode::Verify
    };
    let orchestrator = Orchestrator::new(opt.config());
    let result = orchestrator.run(&opt.target(), mode, !opt.no_rebuild);
    if let Err(e) = &result {
        error!("{}", e);
    }
    std::process::exit(orchestrate::exit_code(&result));
}
