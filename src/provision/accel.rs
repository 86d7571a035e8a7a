//! GPU math library discovery
//!
//! CUDA wheels (`nvidia-cublas-cu12`, `nvidia-cudnn-cu12`) install their
//! shared libraries under `site-packages/nvidia/<pkg>/lib`. The dynamic
//! loader does not look there, so the directories are prefixed onto the
//! worker's library search path. Missing libraries only mean the worker
//! falls back to CPU, so every probing failure is swallowed.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Search path variable the worker's loader reads
#[cfg(target_os = "windows")]
pub const LIBRARY_PATH_VAR: &str = "PATH";
#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

/// NVIDIA wheel packages whose libraries the speech model links against
const NVIDIA_PACKAGES: &[&str] = &["cublas", "cudnn"];

/// Library directories of installed NVIDIA wheels for this interpreter
///
/// Returns an empty list when nothing is found or probing fails.
pub fn discover_accelerator_path(interpreter: &Path) -> Vec<PathBuf> {
    let Some(root) = environment_root(interpreter) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for site_packages in site_packages_dirs(&root) {
        let nvidia = site_packages.join("nvidia");
        if !nvidia.is_dir() {
            continue;
        }
        for package in NVIDIA_PACKAGES {
            let lib = nvidia.join(package).join(lib_dir_name());
            if lib.is_dir() {
                tracing::debug!("Found GPU library directory: {:?}", lib);
                found.push(lib);
            }
        }
    }

    if found.is_empty() {
        tracing::debug!(
            "No GPU libraries under {:?}, worker will run without CUDA",
            root
        );
    }
    found
}

/// Prefix `dirs` onto an existing search path value
///
/// Returns None when there is nothing to add.
pub fn prefixed_search_path(dirs: &[PathBuf], existing: Option<OsString>) -> Option<OsString> {
    if dirs.is_empty() {
        return None;
    }

    let mut entries: Vec<PathBuf> = dirs.to_vec();
    if let Some(existing) = existing {
        entries.extend(std::env::split_paths(&existing));
    }

    match std::env::join_paths(entries) {
        Ok(joined) => Some(joined),
        Err(e) => {
            tracing::debug!("Cannot build library search path: {}", e);
            None
        }
    }
}

/// `<root>/bin/python3` → `<root>`
///
/// Not canonicalized: venv interpreters symlink to the base install, and
/// the venv's own site-packages is the one that matters.
fn environment_root(interpreter: &Path) -> Option<PathBuf> {
    interpreter.parent()?.parent().map(Path::to_path_buf)
}

#[cfg(not(target_os = "windows"))]
fn site_packages_dirs(root: &Path) -> Vec<PathBuf> {
    // lib/python3.X/site-packages, for whatever X is installed
    let Ok(entries) = fs::read_dir(root.join("lib")) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("python3"))
        .map(|e| e.path().join("site-packages"))
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

#[cfg(target_os = "windows")]
fn site_packages_dirs(root: &Path) -> Vec<PathBuf> {
    let dir = root.join("Lib").join("site-packages");
    if dir.is_dir() {
        vec![dir]
    } else {
        Vec::new()
    }
}

fn lib_dir_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "bin"
    } else {
        "lib"
    }
}
