//! Error kinds produced outside the guest exception channel.
//!
//! Runtime exceptions raised by guest code are themselves guest [`Value`](crate::value::Value)s
//! travelling through the VM's handler stack (see [`crate::vm`]); they are not represented
//! here. This module only covers the four host-facing error kinds that abort a pipeline
//! stage before any guest state exists: syntax, compile, deserialize and version
//! errors, plus the small set of reasons the embedding API itself can refuse a call.

use std::fmt;

/// Source location attached to a syntax or compile error (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub const fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A single diagnostic produced by the lexer, parser or compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub path: String,
    pub loc: Location,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File {} [{}]:\n{}", self.path, self.loc, self.message)
    }
}

/// Everything that can go wrong before a guest program starts running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JStarError {
    /// Lexer/parser failed; one entry per diagnostic emitted through the error callback.
    Syntax(Vec<Diagnostic>),
    /// Compiler rejected the AST (duplicate local, `break` outside loop, etc).
    Compile(Vec<Diagnostic>),
    /// A bytecode buffer was structurally malformed.
    Deserialize(String),
    /// A bytecode buffer's version tag does not match this build's.
    Version { expected: u16, found: u16 },
    /// The embedding API was misused (stack underflow, wrong slot type, no such global...).
    Api(String),
}

impl fmt::Display for JStarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JStarError::Syntax(diags) | JStarError::Compile(diags) => {
                for (i, d) in diags.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{d}")?;
                }
                Ok(())
            }
            JStarError::Deserialize(msg) => write!(f, "cannot deserialize bytecode: {msg}"),
            JStarError::Version { expected, found } => {
                write!(f, "bytecode version mismatch: expected {expected}, found {found}")
            }
            JStarError::Api(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for JStarError {}

/// Result code returned by every top-level embedding API entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JStarResult {
    Success = 0,
    SyntaxErr = 1,
    CompileErr = 2,
    RuntimeErr = 3,
    DeserializeErr = 4,
    VersionErr = 5,
}

impl JStarResult {
    pub fn is_success(self) -> bool {
        matches!(self, JStarResult::Success)
    }
}

impl From<&JStarError> for JStarResult {
    fn from(err: &JStarError) -> Self {
        match err {
            JStarError::Syntax(_) => JStarResult::SyntaxErr,
            JStarError::Compile(_) => JStarResult::CompileErr,
            JStarError::Deserialize(_) => JStarResult::DeserializeErr,
            JStarError::Version { .. } => JStarResult::VersionErr,
            JStarError::Api(_) => JStarResult::RuntimeErr,
        }
    }
}

pub type JStarOutcome<T> = Result<T, JStarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_formats_with_path_and_line() {
        let d = Diagnostic {
            path: "main.jsr".to_owned(),
            loc: Location::new(3, 7),
            message: "unexpected token".to_owned(),
        };
        assert_eq!(format!("{d}"), "File main.jsr [3:7]:\nunexpected token");
    }

    #[test]
    fn result_code_maps_from_error_kind() {
        let err = JStarError::Version { expected: 3, found: 1 };
        assert_eq!(JStarResult::from(&err), JStarResult::VersionErr);
    }
}
