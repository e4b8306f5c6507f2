//! Finding test cases on disk.
//!
//! Layout is `chapter_N/<category>/...`.  How source files are grouped into
//! compilation units:
//!
//!  * Files directly inside a category directory, or directly inside its
//!    `extra_credit` directory, are one test case each.
//!  * Any other directory below a category directory is a single multi-file
//!    test case made of the source files directly inside it.  The files are
//!    ordered by name and the first one is the primary file, which names the
//!    expectation file and the executable.
//!  * Files not below any category directory are ignored.
//!
//! Directory entries are always visited in file name order, so the same
//! tree yields the same cases in the same order every time.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;

use crate::category::Category;
use crate::expect;

/// Name of the directory holding optional extra tests within a category.
pub const EXTRA_CREDIT: &str = "extra_credit";

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("test path {} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("could not read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("empty chapter range {low}..={high}")]
    EmptyRange { low: u32, high: u32 },
}

/// One compilation unit under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub category: Category,
    /// Never empty.
    pub source_paths: Vec<PathBuf>,
}

impl TestCase {
    pub fn single(category: Category, path: PathBuf) -> Self {
        Self {
            category,
            source_paths: vec![path],
        }
    }

    pub fn primary_path(&self) -> &Path {
        &self.source_paths[0]
    }

    pub fn expectation_path(&self) -> PathBuf {
        expect::expectation_path(self.primary_path())
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.primary_path().display())?;
        if self.source_paths.len() > 1 {
            write!(f, " (+{} files)", self.source_paths.len() - 1)?;
        }
        Ok(())
    }
}

/// `chapter_low` through `chapter_high` under `base`.
pub fn chapter_roots(base: &Path, low: u32, high: u32) -> Result<Vec<PathBuf>, LocatorError> {
    if low > high {
        return Err(LocatorError::EmptyRange { low, high });
    }
    Ok((low..=high)
        .map(|i| base.join(format!("chapter_{}", i)))
        .collect())
}

#[derive(Debug, Clone)]
pub struct Locator {
    extension: String,
}

impl Default for Locator {
    fn default() -> Self {
        Self::new("c")
    }
}

impl Locator {
    /// Look for source files with the given extension (no dot).
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }

    fn is_source(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(self.extension.as_str())
    }

    /// All test cases at or below `root`.
    pub fn locate(&self, root: &Path) -> Result<Vec<TestCase>, LocatorError> {
        if !root.exists() {
            return Err(LocatorError::NotFound(root.to_owned()));
        }
        // Categories come from where things really are, so `.` or `..`
        // inside a category directory still count.  Case paths keep the
        // form they were given in.
        let resolved = fs::canonicalize(root).map_err(|source| LocatorError::Io {
            path: root.to_owned(),
            source,
        })?;
        let mut cases = vec![];
        if root.is_file() {
            if !self.is_source(root) {
                debug!("{} is not a .{} file, skipping", root.display(), self.extension);
                return Ok(cases);
            }
            match Category::classify(&resolved) {
                Some(category) => cases.push(TestCase::single(category, root.to_owned())),
                None => info!("{} is not in a category directory, skipping", root.display()),
            }
        } else {
            self.walk(root, &resolved, &mut cases)?;
        }
        Ok(cases)
    }

    /// Like `locate` over several roots, but roots that don't exist are
    /// skipped.  Used for chapter ranges, where gaps are normal.
    pub fn locate_existing(&self, roots: &[PathBuf]) -> Result<Vec<TestCase>, LocatorError> {
        let mut cases = vec![];
        for root in roots {
            if !root.exists() {
                debug!("{} does not exist, skipping", root.display());
                continue;
            }
            cases.extend(self.locate(root)?);
        }
        Ok(cases)
    }

    /// `resolved` is `dir` with links and `..` resolved, for classifying.
    fn walk(
        &self,
        dir: &Path,
        resolved: &Path,
        cases: &mut Vec<TestCase>,
    ) -> Result<(), LocatorError> {
        let (files, subdirs) = self.read_sorted(dir)?;

        if !files.is_empty() {
            match dir_category(resolved) {
                None => debug!(
                    "Ignoring {} source file(s) outside any category in {}",
                    files.len(),
                    dir.display()
                ),
                Some(category) if is_flat_dir(resolved) => {
                    cases.extend(files.into_iter().map(|f| TestCase::single(category, f)));
                }
                Some(category) => {
                    debug!("Grouping {} file(s) in {}", files.len(), dir.display());
                    cases.push(TestCase {
                        category,
                        source_paths: files,
                    });
                }
            }
        }

        for sub in subdirs {
            if let Some(name) = sub.file_name() {
                self.walk(&sub, &resolved.join(name), cases)?;
            }
        }
        Ok(())
    }

    /// Source files and subdirectories of `dir`, each sorted by name.
    fn read_sorted(&self, dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), LocatorError> {
        let io_err = |source| LocatorError::Io {
            path: dir.to_owned(),
            source,
        };
        let mut entries = fs::read_dir(dir)
            .map_err(io_err)?
            .map(|e| e.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        entries.sort();

        let mut files = vec![];
        let mut subdirs = vec![];
        for path in entries {
            if path.is_dir() {
                subdirs.push(path);
            } else if path.is_file() && self.is_source(&path) {
                files.push(path);
            }
        }
        Ok((files, subdirs))
    }
}

/// The category of files directly inside `dir`.
fn dir_category(dir: &Path) -> Option<Category> {
    dir.components()
        .rev()
        .filter_map(|c| c.as_os_str().to_str())
        .find_map(Category::from_dir_name)
}

/// Whether every file in `dir` is its own test case.
fn is_flat_dir(dir: &Path) -> bool {
    let name = |p: &Path| p.file_name().and_then(|n| n.to_str()).map(str::to_owned);
    match name(dir) {
        Some(n) if Category::from_dir_name(&n).is_some() => true,
        Some(n) if n == EXTRA_CREDIT => dir
            .parent()
            .and_then(|p| name(p))
            .map_or(false, |p| Category::from_dir_name(&p).is_some()),
        _ => false,
    }
}
