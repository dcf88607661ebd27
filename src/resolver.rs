// src/resolver.rs

//! Executable lookup.
//!
//! A program name containing a path separator is taken literally; anything
//! else is searched for in the `PATH` list, first match wins.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

use nix::unistd::{access, AccessFlags};
use tracing::debug;

use crate::error::{ErrorKind, ExecutionError};

/// Resolves `program` using the `PATH` from `env` overrides, falling back to
/// the inherited `PATH` of this process.
pub fn resolve(program: &str, env: &BTreeMap<String, String>) -> Result<PathBuf, ExecutionError> {
    let search_path = match env.get("PATH") {
        Some(path) => Some(OsString::from(path)),
        None => std::env::var_os("PATH"),
    };
    resolve_in(program, search_path.as_deref())
}

/// Resolves `program` against an explicit path list (`:`-separated on unix).
///
/// A relative literal path is checked against the current directory of this
/// process and returned joined onto it.
pub fn resolve_in(program: &str, search_path: Option<&OsStr>) -> Result<PathBuf, ExecutionError> {
    if program.is_empty() {
        return Err(ExecutionError::new(
            ErrorKind::InvalidArgument,
            "Invalid program name passed",
        ));
    }

    if program.contains(MAIN_SEPARATOR) {
        let literal = PathBuf::from(program);
        if is_executable(&literal) {
            // Anchor relative paths to our cwd; the child may run elsewhere.
            if literal.is_relative() {
                if let Ok(cwd) = std::env::current_dir() {
                    return Ok(cwd.join(literal));
                }
            }
            return Ok(literal);
        }
    } else if let Some(search_path) = search_path {
        for dir in std::env::split_paths(search_path) {
            if dir.as_os_str().is_empty() {
                continue;
            }
            let candidate = dir.join(program);
            if is_executable(&candidate) {
                debug!(program, resolved = %candidate.display(), "Resolved executable on PATH");
                return Ok(candidate);
            }
        }
    }

    Err(ExecutionError::new(
        ErrorKind::NotFound,
        format!("Could not find {}", program),
    ))
}

/// A regular file the current user may execute.
fn is_executable(path: &Path) -> bool {
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

/// Builds a path to `target` that is relative to the current directory,
/// walking up to the root with `..` so the process cwd never has to change.
#[cfg(test)]
pub(crate) fn relative_to_cwd(target: &Path) -> PathBuf {
    let cwd = std::env::current_dir().unwrap();
    let mut relative = PathBuf::new();
    for _ in cwd.components().skip(1) {
        relative.push("..");
    }
    if relative.as_os_str().is_empty() {
        relative.push(".");
    }
    relative.join(target.strip_prefix("/").unwrap())
}
