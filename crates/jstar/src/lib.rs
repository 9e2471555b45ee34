#![doc = include_str!("../../../README.md")]

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod embed;
pub mod error;
pub mod heap;
pub mod intern;
pub mod lexer;
pub mod module;
pub mod parser;
pub mod serialize;
pub mod token;
pub mod types;
pub mod value;
pub mod vm;

pub use config::{Config, ImportCallback, ImportResolution, NoImports};
pub use embed::NativeResult;
pub use error::{Diagnostic, JStarError, JStarOutcome, JStarResult, Location};
pub use heap::{Heap, HeapId};
pub use value::Value;
pub use vm::Vm;
