// Path helpers

use std::path::{Component, Path, PathBuf};

/// Resolve `.` and `..` without touching the filesystem
///
/// `..` at the root stays at the root; leading `..` of a relative path
/// is kept.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Where a link's target lives, relative targets taken from the link's directory
pub fn resolve_link_target(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        return normalize_lexically(target);
    }
    let base = link.parent().unwrap_or_else(|| Path::new(""));
    normalize_lexically(&base.join(target))
}
