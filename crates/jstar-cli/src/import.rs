//! Filesystem-backed [`ImportCallback`] for the reference binaries.

use std::fs;
use std::path::PathBuf;

use jstar::{ImportCallback, ImportResolution, Vm};

pub struct PathImportCallback {
    search_dirs: Vec<PathBuf>,
}

impl PathImportCallback {
    /// `.` is always searched first; `JSTARPATH` entries (platform-delimited) are appended
    /// unless `ignore_env` is set (`-E`/`--ignore-env`).
    pub fn new(ignore_env: bool) -> Self {
        let mut search_dirs = vec![PathBuf::from(".")];
        if !ignore_env {
            if let Ok(path) = std::env::var("JSTARPATH") {
                let sep = if cfg!(windows) { ';' } else { ':' };
                search_dirs.extend(path.split(sep).filter(|s| !s.is_empty()).map(PathBuf::from));
            }
        }
        Self { search_dirs }
    }
}

impl ImportCallback for PathImportCallback {
    fn resolve(&mut self, _vm: &mut Vm, dotted_path: &str) -> ImportResolution {
        let relative = dotted_path.replace('.', "/");
        for dir in &self.search_dirs {
            let source_path = dir.join(format!("{relative}.jsr"));
            if let Ok(code) = fs::read_to_string(&source_path) {
                return ImportResolution::Source { code, path: source_path.display().to_string() };
            }
            let compiled_path = dir.join(format!("{relative}.jsc"));
            if let Ok(bytes) = fs::read(&compiled_path) {
                return ImportResolution::Bytecode { bytes, path: compiled_path.display().to_string() };
            }
        }
        ImportResolution::NotFound
    }
}
