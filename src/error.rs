// ABOUTME: Error types shared by the reader, evaluator and code generator

use thiserror::Error;

// ===== Arity constant strings (eliminates allocations in error paths) =====
pub const ARITY_ONE: &str = "1";
pub const ARITY_TWO: &str = "2";
pub const ARITY_ONE_OR_TWO: &str = "1-2";
pub const ARITY_TWO_OR_THREE: &str = "2-3";
pub const ARITY_AT_LEAST_ONE: &str = "at least 1";
pub const ARITY_AT_LEAST_TWO: &str = "at least 2";

pub type LispResult<T> = Result<T, LispError>;

/// All failure kinds a program author can observe.  Every variant renders as a
/// single line prefixed with the error kind; reader errors additionally carry
/// a `file:line:col` location when one is known.
#[derive(Error, Debug, Clone)]
pub enum LispError {
    #[error("read error{}: {message}", fmt_location(.location))]
    Reader {
        message: String,
        location: Option<String>,
    },

    /// Semantic error in a special form, binding list or generated unit
    #[error("malformed {form}: {message}")]
    Malformed { form: String, message: String },

    #[error("unbound variable: {0}")]
    Unbound(String),

    #[error("{context}: expected {expected}, got {actual}")]
    Type {
        context: String,
        expected: &'static str,
        actual: String,
    },

    #[error("{function}: expected {expected} argument{}, got {actual}", if *.expected == "1" { "" } else { "s" })]
    Arity {
        function: String,
        expected: String, // "2", "1-2", "at least 1"
        actual: usize,
    },

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),
}

fn fmt_location(location: &Option<String>) -> String {
    match location {
        Some(loc) => format!(" at {}", loc),
        None => String::new(),
    }
}

impl LispError {
    pub fn reader(message: impl Into<String>, location: Option<String>) -> Self {
        LispError::Reader {
            message: message.into(),
            location,
        }
    }

    pub fn malformed(form: &str, message: impl Into<String>) -> Self {
        LispError::Malformed {
            form: form.to_string(),
            message: message.into(),
        }
    }

    pub fn type_error(context: &str, expected: &'static str, actual: impl Into<String>) -> Self {
        LispError::Type {
            context: context.to_string(),
            expected,
            actual: actual.into(),
        }
    }

    pub fn arity(function: &str, expected: impl Into<String>, actual: usize) -> Self {
        LispError::Arity {
            function: function.to_string(),
            expected: expected.into(),
            actual,
        }
    }

    /// Suffix the failing top-level form so embedder entry points report
    /// "error occurred in ..." on one line.
    pub fn in_form(self, printed_form: &str) -> Self {
        const LIMIT: usize = 40;
        let mut shown: String = printed_form.chars().take(LIMIT).collect();
        if printed_form.chars().count() > LIMIT {
            shown.push_str("...");
        }
        match self {
            LispError::Internal(m) if m.contains("error occurred in") => LispError::Internal(m),
            other => LispError::Internal(format!("{} - error occurred in {}", other, shown)),
        }
    }
}

impl From<std::io::Error> for LispError {
    fn from(e: std::io::Error) -> Self {
        LispError::Io(e.to_string())
    }
}

impl From<std::fmt::Error> for LispError {
    fn from(e: std::fmt::Error) -> Self {
        LispError::Internal(format!("source emission failed: {}", e))
    }
}
