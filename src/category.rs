//! Test categories.
//!
//! A test case's category says where in the compiler's pipeline it is
//! expected to stop: not at all (`valid`), or in the lexer, parser or
//! semantic checker.  It's determined purely by the name of a directory
//! the source file lives in.

use std::fmt;
use std::path::Path;

/// Which kind of outcome a test case expects.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Valid,
    InvalidLex,
    InvalidParse,
    InvalidSemantics,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Valid,
        Category::InvalidLex,
        Category::InvalidParse,
        Category::InvalidSemantics,
    ];

    /// The directory name that marks this category.
    pub fn dir_name(self) -> &'static str {
        match self {
            Category::Valid => "valid",
            Category::InvalidLex => "invalid_lex",
            Category::InvalidParse => "invalid_parse",
            Category::InvalidSemantics => "invalid_semantics",
        }
    }

    /// Exact match only; `invalid_lexer_helpers` is not `invalid_lex`.
    pub fn from_dir_name(name: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.dir_name() == name)
    }

    /// Classify a source file by the nearest ancestor directory named after
    /// a category.  The file name itself is never considered.
    ///
    /// `extra_credit` directories need no special casing here, they just
    /// sit below a category directory and so inherit it.
    pub fn classify(path: &Path) -> Option<Category> {
        path.parent()?
            .components()
            .rev()
            .filter_map(|c| c.as_os_str().to_str())
            .find_map(Category::from_dir_name)
    }

    pub fn is_valid(self) -> bool {
        self == Category::Valid
    }

    /// Diagnostic text the compiler must put on stderr when it fails at
    /// this category's stage.
    pub fn marker(self) -> Option<&'static str> {
        match self {
            Category::Valid => None,
            Category::InvalidLex => Some("Lex error"),
            Category::InvalidParse => Some("Parse error"),
            Category::InvalidSemantics => Some("Semantic error"),
        }
    }

    /// Exit code the compiler uses to report failure at this stage.
    /// Part of the compiler's CLI contract; 0 is success.
    pub fn failure_exit_code(self) -> Option<i32> {
        match self {
            Category::Valid => None,
            Category::InvalidLex => Some(2),
            Category::InvalidParse => Some(3),
            Category::InvalidSemantics => Some(4),
        }
    }

    /// Short stage name, "lex", "parse", ...
    pub fn stage(self) -> &'static str {
        match self {
            Category::Valid => "run",
            Category::InvalidLex => "lex",
            Category::InvalidParse => "parse",
            Category::InvalidSemantics => "semantic",
        }
    }

    /// What the stage is doing, for messages like "parsing succeeded".
    pub fn gerund(self) -> &'static str {
        match self {
            Category::Valid => "running",
            Category::InvalidLex => "lexing",
            Category::InvalidParse => "parsing",
            Category::InvalidSemantics => "semantic checking",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn classify(s: &str) -> Option<Category> {
        Category::classify(&PathBuf::from(s))
    }

    #[test]
    fn classify_by_directory() {
        assert_eq!(classify("chapter_1/valid/return_2.c"), Some(Category::Valid));
        assert_eq!(
            classify("chapter_1/invalid_lex/at_sign.c"),
            Some(Category::InvalidLex)
        );
        assert_eq!(
            classify("tests/chapter_5/invalid_semantics/undeclared.c"),
            Some(Category::InvalidSemantics)
        );
        assert_eq!(classify("chapter_1/return_2.c"), None);
    }

    #[test]
    fn extra_credit_inherits_parent() {
        assert_eq!(
            classify("chapter_3/invalid_parse/extra_credit/bad_bitwise.c"),
            Some(Category::InvalidParse)
        );
        assert_eq!(
            classify("chapter_3/valid/extra_credit/bitwise.c"),
            Some(Category::Valid)
        );
    }

    #[test]
    fn no_substring_matches() {
        assert_eq!(classify("chapter_1/invalid_lexer_helpers/foo.c"), None);
        assert_eq!(classify("chapter_1/validation/foo.c"), None);
        // The file name is not a directory.
        assert_eq!(classify("chapter_1/valid.c"), None);
    }

    #[test]
    fn nearest_category_wins() {
        assert_eq!(
            classify("valid/invalid_parse/missing_semicolon.c"),
            Some(Category::InvalidParse)
        );
    }

    #[test]
    fn stage_contract() {
        assert_eq!(Category::Valid.failure_exit_code(), None);
        assert_eq!(Category::InvalidLex.failure_exit_code(), Some(2));
        assert_eq!(Category::InvalidParse.failure_exit_code(), Some(3));
        assert_eq!(Category::InvalidSemantics.failure_exit_code(), Some(4));
        assert_eq!(Category::InvalidParse.marker(), Some("Parse error"));
        for c in Category::ALL.iter() {
            assert_eq!(Category::from_dir_name(c.dir_name()), Some(*c));
        }
    }
}
