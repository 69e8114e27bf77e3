//! Path sandboxing for the files archive.
//!
//! Every path the guest hands to `System.files` is an absolute, `/`-rooted
//! string. This module resolves it against the archive's on-disk root and
//! rejects any attempt to climb above that root.

use std::path::{Component, Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// Resolves a guest-supplied archive path (e.g. `/notes/todo.txt`) into a
/// real filesystem path rooted at `root`, rejecting `..` traversal that
/// would escape `root` and rejecting non-absolute input.
pub fn resolve(root: &Path, guest_path: &str) -> CoreResult<PathBuf> {
    if !guest_path.starts_with('/') {
        return Err(CoreError::PathEscape(PathBuf::from(guest_path)));
    }

    let mut real = root.to_path_buf();
    for component in Path::new(guest_path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => real.push(part),
            Component::ParentDir => {
                if !real.pop() || real == root.parent().unwrap_or(root) {
                    return Err(CoreError::PathEscape(PathBuf::from(guest_path)));
                }
                if !real.starts_with(root) {
                    return Err(CoreError::PathEscape(PathBuf::from(guest_path)));
                }
            }
            Component::Prefix(_) => {
                return Err(CoreError::PathEscape(PathBuf::from(guest_path)));
            }
        }
    }

    if !real.starts_with(root) {
        return Err(CoreError::PathEscape(PathBuf::from(guest_path)));
    }

    Ok(real)
}
