//! Expectation files.
//!
//! Each test case `foo.c` has a sibling `foo.txt` holding what running it is
//! supposed to produce:
//!
//! ```text
//! exit_code: 0
//! stdout: b'3\n'
//! stderr: b''
//! ```
//!
//! Every line is optional and lines may come in any order, but each key may
//! only appear once.  A field that's absent simply isn't checked.
//!
//! Stream contents are stored as byte string literals since process output
//! is not necessarily UTF-8.  The literal syntax is the one Python's
//! `bytes.__repr__` produces, which is what old expectation files were
//! generated with, so those still load.  We only understand a fixed set of
//! escapes; anything else is an error rather than a guess.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::warn;
use thiserror::Error;

use crate::driver::RunResult;

/// Extension of expectation files.
pub const EXPECTATION_EXTENSION: &str = "txt";

/// Where the expectation record for a given source file lives.
pub fn expectation_path(source: &Path) -> PathBuf {
    source.with_extension(EXPECTATION_EXTENSION)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiteralError {
    #[error("byte literal must start with b' or b\"")]
    MissingPrefix,
    #[error("byte literal is not terminated")]
    Unterminated,
    #[error("trailing characters after byte literal: {0:?}")]
    Trailing(String),
    #[error("byte literals may only contain ASCII, found {0:?}")]
    NonAscii(char),
    #[error("unknown escape sequence \\{0}")]
    UnknownEscape(char),
    #[error("bad \\x escape, expected two hex digits")]
    BadHexEscape,
    #[error("octal escape \\{0} is out of range")]
    OctalOutOfRange(String),
}

#[derive(Debug, Error)]
pub enum ExpectError {
    #[error("line {line}: duplicate `{key}` entry")]
    Duplicate { line: usize, key: &'static str },
    #[error("line {line}: invalid exit code {value:?}")]
    BadExitCode { line: usize, value: String },
    #[error("line {line}: {source}")]
    BadLiteral {
        line: usize,
        #[source]
        source: LiteralError,
    },
    #[error("could not read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ExpectError {
    /// The record file just isn't there, as opposed to being broken.
    pub fn is_missing(&self) -> bool {
        matches!(self, ExpectError::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// What a test case is supposed to produce.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectationRecord {
    pub exit_code: Option<i32>,
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

impl ExpectationRecord {
    /// Record everything a trusted run produced.
    pub fn from_run(run: &RunResult) -> Self {
        Self {
            exit_code: Some(run.exit_code),
            stdout: Some(run.stdout.clone()),
            stderr: Some(run.stderr.clone()),
        }
    }

    pub fn parse(src: &str) -> Result<Self, ExpectError> {
        let mut record = ExpectationRecord::default();
        for (idx, raw) in src.lines().enumerate() {
            let line = idx + 1;
            let text = raw.trim();
            if text.is_empty() {
                continue;
            }
            let (key, value) = match text.split_once(':') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => {
                    warn!("Ignoring unrecognized expectation line {}: {:?}", line, raw);
                    continue;
                }
            };
            match key {
                "exit_code" => {
                    if record.exit_code.is_some() {
                        return Err(ExpectError::Duplicate {
                            line,
                            key: "exit_code",
                        });
                    }
                    let code = value.parse().map_err(|_| ExpectError::BadExitCode {
                        line,
                        value: value.to_owned(),
                    })?;
                    record.exit_code = Some(code);
                }
                "stdout" => set_stream(&mut record.stdout, "stdout", line, value)?,
                "stderr" => set_stream(&mut record.stderr, "stderr", line, value)?,
                other => warn!("Ignoring unknown expectation key {:?} on line {}", other, line),
            }
        }
        Ok(record)
    }

    pub fn load(path: &Path) -> Result<Self, ExpectError> {
        let src = fs::read_to_string(path).map_err(|source| ExpectError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&src)
    }

    /// Serialize in a fixed field order so the same record always
    /// produces the same bytes.
    pub fn write_to(&self, out: &mut dyn io::Write) -> io::Result<()> {
        if let Some(code) = self.exit_code {
            writeln!(out, "exit_code: {}", code)?;
        }
        if let Some(stdout) = &self.stdout {
            writeln!(out, "stdout: {}", encode_bytes_literal(stdout))?;
        }
        if let Some(stderr) = &self.stderr {
            writeln!(out, "stderr: {}", encode_bytes_literal(stderr))?;
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ExpectError> {
        let write_err = |source| ExpectError::Write {
            path: path.to_owned(),
            source,
        };
        let mut out = io::BufWriter::new(fs::File::create(path).map_err(write_err)?);
        self.write_to(&mut out).map_err(write_err)?;
        out.flush().map_err(write_err)
    }
}

fn set_stream(
    slot: &mut Option<Vec<u8>>,
    key: &'static str,
    line: usize,
    value: &str,
) -> Result<(), ExpectError> {
    if slot.is_some() {
        return Err(ExpectError::Duplicate { line, key });
    }
    let bytes =
        decode_bytes_literal(value).map_err(|source| ExpectError::BadLiteral { line, source })?;
    *slot = Some(bytes);
    Ok(())
}

/// Render bytes as a literal, exactly like Python's `repr(bytes)`.
pub fn encode_bytes_literal(bytes: &[u8]) -> String {
    let quote = if bytes.contains(&b'\'') && !bytes.contains(&b'"') {
        b'"'
    } else {
        b'\''
    };
    let mut s = String::with_capacity(bytes.len() + 3);
    s.push('b');
    s.push(quote as char);
    for &b in bytes {
        match b {
            b'\\' => s.push_str("\\\\"),
            b'\t' => s.push_str("\\t"),
            b'\n' => s.push_str("\\n"),
            b'\r' => s.push_str("\\r"),
            _ if b == quote => {
                s.push('\\');
                s.push(quote as char);
            }
            0x20..=0x7e => s.push(b as char),
            _ => s.push_str(&format!("\\x{:02x}", b)),
        }
    }
    s.push(quote as char);
    s
}

/// Parse a `b'...'` or `b"..."` literal into the bytes it denotes.
pub fn decode_bytes_literal(lit: &str) -> Result<Vec<u8>, LiteralError> {
    let lit = lit.trim_end();
    let body = lit.strip_prefix('b').ok_or(LiteralError::MissingPrefix)?;
    let mut chars = body.chars();
    let quote = match chars.next() {
        Some(q @ '\'') | Some(q @ '"') => q,
        _ => return Err(LiteralError::MissingPrefix),
    };

    let mut out = vec![];
    loop {
        let c = chars.next().ok_or(LiteralError::Unterminated)?;
        if c == quote {
            break;
        }
        if !c.is_ascii() {
            return Err(LiteralError::NonAscii(c));
        }
        if c != '\\' {
            out.push(c as u8);
            continue;
        }
        let esc = chars.next().ok_or(LiteralError::Unterminated)?;
        match esc {
            '\\' => out.push(b'\\'),
            '\'' => out.push(b'\''),
            '"' => out.push(b'"'),
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            'a' => out.push(0x07),
            'b' => out.push(0x08),
            'f' => out.push(0x0c),
            'v' => out.push(0x0b),
            'x' => {
                let hi = chars.next().and_then(|c| c.to_digit(16));
                let lo = chars.next().and_then(|c| c.to_digit(16));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push((hi * 16 + lo) as u8),
                    _ => return Err(LiteralError::BadHexEscape),
                }
            }
            '0'..='7' => {
                let mut digits = String::new();
                digits.push(esc);
                // Up to two more octal digits; peek via a clone.
                for _ in 0..2 {
                    let mut peek = chars.clone();
                    match peek.next() {
                        Some(d @ '0'..='7') => {
                            digits.push(d);
                            chars = peek;
                        }
                        _ => break,
                    }
                }
                let value = u32::from_str_radix(&digits, 8)
                    .map_err(|_| LiteralError::OctalOutOfRange(digits.clone()))?;
                if value > 0xff {
                    return Err(LiteralError::OctalOutOfRange(digits));
                }
                out.push(value as u8);
            }
            other => return Err(LiteralError::UnknownEscape(other)),
        }
    }

    let rest = chars.as_str();
    if !rest.trim().is_empty() {
        return Err(LiteralError::Trailing(rest.to_owned()));
    }
    Ok(out)
}
