//! Path handling.
//!
//! Paths are resolved as a sequence of names walked from the root on every
//! call. There is no path cache, so a rename is visible to the next lookup.

use std::path::{Component, Path, PathBuf};

use super::error::{StoreError, StoreResult};
use super::types::MAX_NAME_LEN;

/// Normalize a path to its absolute form: leading `/`, `.` dropped, `..`
/// resolved lexically, no trailing slash.
///
/// Grants are keyed on this form, so `/a/./b` and `/a/b` share a scope key.
pub fn normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(s) => result.push(s),
        }
    }
    result
}

/// Returns true if `path` is `ancestor` or lies beneath it.
pub fn is_within(path: &Path, ancestor: &Path) -> bool {
    path.starts_with(ancestor)
}

/// Split a path into validated names, root first.
///
/// The root itself yields an empty vector.
pub(crate) fn components(path: &Path) -> StoreResult<Vec<String>> {
    let normalized = normalize(path);
    let mut names = Vec::new();
    for component in normalized.components() {
        if let Component::Normal(s) = component {
            let name = s
                .to_str()
                .ok_or_else(|| StoreError::invalid_path(normalized.display().to_string()))?;
            if name.len() > MAX_NAME_LEN {
                return Err(StoreError::NameTooLong(name.to_string()));
            }
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Display form used in error messages.
pub(crate) fn display(names: &[String]) -> String {
    format!("/{}", names.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Path::new("a/b")), Path::new("/a/b"));
        assert_eq!(normalize(Path::new("/a/./b/")), Path::new("/a/b"));
        assert_eq!(normalize(Path::new("/a/b/../c")), Path::new("/a/c"));
        assert_eq!(normalize(Path::new("/../..")), Path::new("/"));
        assert_eq!(normalize(Path::new("")), Path::new("/"));
    }

    #[test]
    fn test_components() {
        assert!(components(Path::new("/")).unwrap().is_empty());
        assert_eq!(
            components(Path::new("/x/y")).unwrap(),
            vec!["x".to_string(), "y".to_string()]
        );
    }

    #[test]
    fn test_name_too_long() {
        let long = format!("/{}", "n".repeat(MAX_NAME_LEN + 1));
        assert!(matches!(
            components(Path::new(&long)),
            Err(StoreError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_is_within() {
        assert!(is_within(Path::new("/a/b"), Path::new("/a")));
        assert!(is_within(Path::new("/a"), Path::new("/a")));
        assert!(!is_within(Path::new("/ab"), Path::new("/a")));
    }
}
