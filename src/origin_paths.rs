//! Purpose: Origin-directory resolution for the CLI.
//! Exports: `default_origin_root`, `default_origin_dir`, `resolve_named_origin`.
//! Role: Keep `--dir`, `--origin`, and the default pointing at the same layout.
//! Invariants: Origins live under `~/.cartsync/origins/<name>`.
//! Invariants: Origin names must not contain path separators or be empty.

use std::path::{Path, PathBuf};

pub(crate) const DEFAULT_ORIGIN: &str = "default";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OriginNameResolveError {
    Empty,
    ContainsPathSeparator,
}

pub(crate) fn default_origin_root() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".cartsync").join("origins")
}

pub(crate) fn default_origin_dir() -> PathBuf {
    default_origin_root().join(DEFAULT_ORIGIN)
}

pub(crate) fn resolve_named_origin(
    name: &str,
    origin_root: &Path,
) -> Result<PathBuf, OriginNameResolveError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(OriginNameResolveError::Empty);
    }
    if name.contains('/') || name.contains('\\') {
        return Err(OriginNameResolveError::ContainsPathSeparator);
    }
    Ok(origin_root.join(name))
}
