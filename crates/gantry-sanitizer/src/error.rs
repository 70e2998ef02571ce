use std::fmt;

use thiserror::Error;

/// Why a single argument value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DangerousInputReason {
    Empty,
    ShellMetacharacter(char),
    NulByte,
    LineBreak,
    PathTraversal,
    ExcessiveWhitespace,
    TooLong { length: usize, max: usize },
    NestingTooDeep { max: usize },
}

impl fmt::Display for DangerousInputReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty argument"),
            Self::ShellMetacharacter(ch) => write!(f, "shell metacharacter '{ch}'"),
            Self::NulByte => write!(f, "NUL byte"),
            Self::LineBreak => write!(f, "line break"),
            Self::PathTraversal => write!(f, "directory traversal sequence '..'"),
            Self::ExcessiveWhitespace => write!(f, "excessive whitespace"),
            Self::TooLong { length, max } => {
                write!(f, "argument is {length} chars, limit is {max}")
            }
            Self::NestingTooDeep { max } => {
                write!(f, "structured input nested deeper than {max} levels")
            }
        }
    }
}

/// Validation failures raised before any process is spawned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanitizeError {
    #[error("unsupported command '{command}'")]
    UnsupportedCommand { command: String },
    #[error("invalid operation '{operation}'")]
    InvalidOperation { operation: String },
    #[error("dangerous input rejected ({reason}): {value:?}")]
    DangerousInput {
        value: String,
        reason: DangerousInputReason,
    },
    #[error("dangerous command '{command}' found in argument {value:?}")]
    DangerousCommand { command: String, value: String },
}

impl SanitizeError {
    /// Returns the stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedCommand { .. } => "UNSUPPORTED_COMMAND",
            Self::InvalidOperation { .. } => "INVALID_OPERATION",
            Self::DangerousInput { .. } => "DANGEROUS_INPUT",
            Self::DangerousCommand { .. } => "DANGEROUS_COMMAND",
        }
    }
}
