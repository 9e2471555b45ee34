//! Shared plumbing for the `jstar`/`jstarc` reference binaries.

pub mod import;
