//! Injection-proof argument vector construction for external tool invocations.
//!
//! Every value that reaches a spawned process passes through
//! [`CommandSanitizer::sanitize`]. The output is a plain argv that is executed
//! without any shell layer.

mod error;
mod policy;
mod sanitizer;

pub use error::{DangerousInputReason, SanitizeError};
pub use policy::{
    default_allowed_commands, default_allowed_operations, default_dangerous_commands,
    SanitizerPolicy, DEFAULT_MAX_ARGUMENT_LENGTH, DEFAULT_MAX_STRUCTURED_DEPTH,
};
pub use sanitizer::{CommandArg, CommandSanitizer, DANGEROUS_CHARACTERS};
