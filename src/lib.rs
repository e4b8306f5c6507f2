//! Golden-file test runner for an external compiler.
//!
//! Test programs live in `chapter_N/<category>/` directories, where the
//! category says whether the program is valid or where in the compiler it
//! should be rejected.  Each test case has an expectation file next to it
//! recording the exit code, stdout and stderr it should produce.  In
//! verification mode we run the compiler (and, for valid programs, the
//! program it produces) and compare against those files; in generation mode
//! we write them, from a reference compiler for valid programs and from the
//! compiler under test itself for invalid ones.
//#![deny(missing_docs)]

pub mod category;
pub mod compare;
pub mod driver;
pub mod expect;
pub mod locate;
pub mod orchestrate;

pub use category::Category;
pub use compare::{verdict, FailReason, Statistics, Verdict};
pub use driver::{CompilerDriver, ReferenceDriver, RunResult};
pub use expect::ExpectationRecord;
pub use locate::{Locator, TestCase};
pub use orchestrate::{CancelToken, Config, Mode, Orchestrator, RunError, Target};
