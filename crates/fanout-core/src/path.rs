//! Path validation and conversion utilities
//!
//! Every relative path that crosses the wire (an event path, an HTTP request
//! path, a download location) is validated here before it touches the
//! filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::ProtocolError;
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Validate and resolve a path safely within a base directory.
///
/// Rejects absolute paths, `..` components and null bytes, and ensures the
/// result stays under `base`. Works on paths that do not exist yet, without
/// following symlinks.
pub fn safe_path(base: &Path, relative: &str) -> Result<PathBuf, ProtocolError> {
    if relative.contains('\0') {
        return Err(ProtocolError::PathTraversal(
            "path contains null byte".into(),
        ));
    }

    if relative.len() > MAX_PATH_LEN {
        return Err(ProtocolError::PathTraversal(format!(
            "path too long: {} bytes (max {})",
            relative.len(),
            MAX_PATH_LEN
        )));
    }

    let relative_path = Path::new(relative);

    if relative_path.is_absolute() {
        return Err(ProtocolError::PathTraversal(
            "absolute paths not allowed".into(),
        ));
    }

    let mut result = base.to_path_buf();

    for component in relative_path.components() {
        match component {
            Component::Normal(name) => {
                let name_str = name.to_string_lossy();
                if name_str.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::PathTraversal(format!(
                        "filename too long: {} bytes (max {})",
                        name_str.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
            }
            Component::ParentDir => {
                return Err(ProtocolError::PathTraversal(
                    "parent directory (..) not allowed".into(),
                ));
            }
            Component::CurDir => {}
            Component::Prefix(_) => {
                return Err(ProtocolError::PathTraversal(
                    "path prefixes not allowed".into(),
                ));
            }
            Component::RootDir => {
                return Err(ProtocolError::PathTraversal(
                    "root directory not allowed in relative path".into(),
                ));
            }
        }
    }

    if !result.starts_with(base) {
        return Err(ProtocolError::PathTraversal(
            "path escapes base directory".into(),
        ));
    }

    Ok(result)
}

/// Validate that an existing path resolves to within the base directory,
/// following symlinks.
///
/// Call after an existence check, before reading file contents.
pub fn safe_real_path(base: &Path, path: &Path) -> Result<PathBuf, ProtocolError> {
    let canonical_base = base
        .canonicalize()
        .map_err(|e| ProtocolError::PathTraversal(format!("cannot canonicalize base: {}", e)))?;

    let canonical_path = path
        .canonicalize()
        .map_err(|e| ProtocolError::PathTraversal(format!("cannot canonicalize path: {}", e)))?;

    if !canonical_path.starts_with(&canonical_base) {
        return Err(ProtocolError::PathTraversal(
            "symlink escapes shared directory".into(),
        ));
    }

    Ok(canonical_path)
}

/// Resolve a percent-encoded URL path (`/dir/a%20b.txt`) under `base`.
///
/// An empty path (the base itself) is rejected: only files are mirrored.
pub fn resolve_url_path(base: &Path, url_path: &str) -> Result<PathBuf, ProtocolError> {
    let decoded = urlencoding::decode(url_path)
        .map_err(|e| ProtocolError::PathTraversal(format!("invalid percent-encoding: {}", e)))?;
    let relative = decoded.trim_start_matches('/');

    if relative.is_empty() {
        return Err(ProtocolError::PathTraversal("empty path".into()));
    }

    safe_path(base, relative)
}

/// Render a root-relative path the way it travels on the wire: `/`-separated,
/// no leading slash.
pub fn to_wire(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_path_normal() {
        let base = Path::new("/mirror");
        assert_eq!(
            safe_path(base, "dir/file.txt").unwrap(),
            PathBuf::from("/mirror/dir/file.txt")
        );
        assert_eq!(
            safe_path(base, "./file.txt").unwrap(),
            PathBuf::from("/mirror/file.txt")
        );
    }

    #[test]
    fn test_safe_path_traversal_blocked() {
        let base = Path::new("/mirror");
        assert!(safe_path(base, "../etc/passwd").is_err());
        assert!(safe_path(base, "dir/../../etc").is_err());
        assert!(safe_path(base, "/etc/passwd").is_err());
        assert!(safe_path(base, "file\0.txt").is_err());
    }

    #[test]
    fn test_safe_path_long_filename() {
        let base = Path::new("/mirror");
        let long_name = "a".repeat(MAX_FILENAME_LEN + 1);
        assert!(safe_path(base, &long_name).is_err());
    }

    #[test]
    fn test_resolve_url_path() {
        let base = Path::new("/mirror");
        assert_eq!(
            resolve_url_path(base, "/shows/a%20b.mkv").unwrap(),
            PathBuf::from("/mirror/shows/a b.mkv")
        );
        assert!(resolve_url_path(base, "/").is_err());
        assert!(resolve_url_path(base, "/%2E%2E/secret").is_err());
    }

    #[test]
    fn test_safe_real_path_symlink_escape() {
        let base = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), b"x").unwrap();
        std::fs::write(base.path().join("inside"), b"y").unwrap();

        assert!(safe_real_path(base.path(), &base.path().join("inside")).is_ok());

        #[cfg(unix)]
        {
            let link = base.path().join("link");
            std::os::unix::fs::symlink(outside.path().join("secret"), &link).unwrap();
            assert!(safe_real_path(base.path(), &link).is_err());
        }
    }

    #[test]
    fn test_to_wire() {
        assert_eq!(to_wire(Path::new("a/b/c.txt")), "a/b/c.txt");
        assert_eq!(to_wire(Path::new("./a.txt")), "a.txt");
    }
}
