//! Implementation of the scheduler argument quoter.
//!
//! The scheduler's "new" argument syntax groups whitespace with single
//! quotes only, and a literal quote character inside a quoted region is
//! written by doubling it. Raw argument strings in a workflow description
//! use the familiar shell-ish notation instead: single quotes, double quotes
//! and backslash escapes. [`quote`] translates the latter into the former.
//!
//! The translation is a small deterministic automaton:
//!
//! | state       | `\`            | `'`                | `"`                | other     |
//! |-------------|----------------|--------------------|--------------------|-----------|
//! | bare        | escaped        | in-single, emit `'`| in-double, emit `'`| emit char |
//! | escaped     | bare, emit `\` | bare, emit `''`    | bare, emit `""`    | bare, emit char |
//! | in-single   | emit `\`       | bare, emit `'`     | emit `""`          | emit char |
//! | in-double   | emit `\`       | emit `''`          | bare, emit `'`     | emit char |
//!
//! Reaching the end of the input in any state but `bare` is an error.

use std::fmt;

/// Represents the live states of the quoting automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Outside of any quoted region.
    Bare,
    /// The previous character was an unquoted backslash.
    Escaped,
    /// Inside a single-quoted region.
    InSingle,
    /// Inside a double-quoted region.
    InDouble,
}

/// The kind of malformed input detected by the quoter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteErrorKind {
    /// The input ended directly after a backslash.
    DanglingEscape,
    /// A single-quoted region was never closed.
    UnmatchedSingleQuote,
    /// A double-quoted region was never closed.
    UnmatchedDoubleQuote,
}

impl fmt::Display for QuoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingEscape => write!(f, "unexpected end of input after a backslash"),
            Self::UnmatchedSingleQuote => write!(f, "unmatched single quote"),
            Self::UnmatchedDoubleQuote => write!(f, "unmatched double quote"),
        }
    }
}

/// An error returned by [`quote`] for malformed argument strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} at character position {position}")]
pub struct QuoteError {
    /// What went wrong.
    pub kind: QuoteErrorKind,
    /// The character position at which the error was detected.
    pub position: usize,
}

/// Quotes a raw argument string for the scheduler's argument grammar.
///
/// When `enclose` is `true` the result is wrapped in a pair of double
/// quotes, which is the form the `arguments` submit attribute expects.
pub fn quote(raw: &str, enclose: bool) -> Result<String, QuoteError> {
    let mut out = String::with_capacity(raw.len() + 2);
    if enclose {
        out.push('"');
    }

    let mut state = State::Bare;
    let mut position = 0;
    for ch in raw.chars() {
        state = match (state, ch) {
            (State::Bare, '\\') => State::Escaped,
            (State::Bare, '\'') => {
                out.push('\'');
                State::InSingle
            }
            (State::Bare, '"') => {
                out.push('\'');
                State::InDouble
            }
            (State::Bare, c) => {
                out.push(c);
                State::Bare
            }
            (State::Escaped, '\'') => {
                out.push_str("''");
                State::Bare
            }
            (State::Escaped, '"') => {
                out.push_str("\"\"");
                State::Bare
            }
            (State::Escaped, c) => {
                out.push(c);
                State::Bare
            }
            (State::InSingle, '\'') => {
                out.push('\'');
                State::Bare
            }
            (State::InSingle, '"') => {
                out.push_str("\"\"");
                State::InSingle
            }
            (State::InSingle, c) => {
                out.push(c);
                State::InSingle
            }
            (State::InDouble, '"') => {
                out.push('\'');
                State::Bare
            }
            (State::InDouble, '\'') => {
                out.push_str("''");
                State::InDouble
            }
            (State::InDouble, c) => {
                out.push(c);
                State::InDouble
            }
        };
        position += 1;
    }

    let kind = match state {
        State::Bare => None,
        State::Escaped => Some(QuoteErrorKind::DanglingEscape),
        State::InSingle => Some(QuoteErrorKind::UnmatchedSingleQuote),
        State::InDouble => Some(QuoteErrorKind::UnmatchedDoubleQuote),
    };
    if let Some(kind) = kind {
        return Err(QuoteError { kind, position });
    }

    if enclose {
        out.push('"');
    }
    Ok(out)
}
