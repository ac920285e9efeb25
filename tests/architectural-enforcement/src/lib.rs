//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles:
//! - No thread sleeps in production code (everything that waits is a tokio timer)
//! - Only the connection registry owns and mutates connection entries
//! - No lazily initialized process-wide state
//! - No `unwrap()`/`expect()` on production paths
//!
//! These tests are designed to catch violations early in the development cycle.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// A production source file with its test module stripped
#[derive(Debug)]
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// Lines up to the first `#[cfg(test)]`
    pub production: Vec<String>,
}

impl SourceFile {
    /// 1-based line numbers of production lines containing `needle`
    ///
    /// Comment lines are skipped.
    #[must_use]
    pub fn find(&self, needle: &str) -> Vec<usize> {
        self.production
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                let trimmed = line.trim_start();
                !trimmed.starts_with("//") && line.contains(needle)
            })
            .map(|(i, _)| i + 1)
            .collect()
    }

    /// File name, e.g. `registry.rs`
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }
}

/// Workspace root (two levels above this crate)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Production Rust sources under `relative` (a `src` directory)
#[must_use]
pub fn production_sources(relative: &str) -> Vec<SourceFile> {
    let root = workspace_root();
    WalkDir::new(root.join(relative))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rs"))
        .filter_map(|entry| {
            let text = fs::read_to_string(entry.path()).ok()?;
            let production = text
                .lines()
                .take_while(|line| !line.trim_start().starts_with("#[cfg(test)]"))
                .map(str::to_string)
                .collect();
            let path = entry
                .path()
                .strip_prefix(&root)
                .unwrap_or(entry.path())
                .to_path_buf();
            Some(SourceFile { path, production })
        })
        .collect()
}

/// Sources of every relay crate
#[must_use]
pub fn relay_sources() -> Vec<SourceFile> {
    let mut files = production_sources("relay/core/src");
    files.extend(production_sources("relay/daemon/src"));
    files
}

/// `path:line` for every occurrence of any needle
#[must_use]
pub fn violations(files: &[SourceFile], needles: &[&str]) -> Vec<String> {
    files
        .iter()
        .flat_map(|file| {
            needles.iter().flat_map(move |needle| {
                file.find(needle)
                    .into_iter()
                    .map(move |line| format!("{}:{line} ({needle})", file.path.display()))
            })
        })
        .collect()
}
