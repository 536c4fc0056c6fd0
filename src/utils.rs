//! Binary lookup and configuration directory helpers
//!
//! The config directory follows the XDG Base Directory specification:
//! `~/.config/iptctl/` on Linux.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "iptctl", "iptctl").map(|pd| pd.config_dir().to_path_buf())
}

/// Finds `name` in the directories listed in `PATH`.
///
/// Returns the first regular file found, without checking execute permission;
/// a non-executable hit surfaces later as a spawn error.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    find_in_dirs(name, std::env::split_paths(&paths))
}

fn find_in_dirs(name: &str, dirs: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    dirs.into_iter().find_map(|dir| {
        let full_path = dir.join(name);
        full_path.is_file().then_some(full_path)
    })
}

/// Returns true if `path` looks like an explicit path rather than a bare name.
pub fn is_explicit_path(path: &Path) -> bool {
    path.components().count() > 1 || path.is_absolute()
}
