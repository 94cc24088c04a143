//! Path normalization.
//!
//! Paths are slash-delimited and byte-compared. `.` segments are dropped and
//! `..` is resolved lexically before any lookup; walking above the root is
//! an error rather than a silent clamp.

use moss_error::{FsError, Result};
use moss_types::NAME_MAX;

/// Split a path into its resolved segments. The root resolves to an empty
/// vector.
pub(crate) fn normalize(path: &str) -> Result<Vec<String>> {
    if path.is_empty() {
        return Err(FsError::InvalidArgument("empty path".to_owned()));
    }
    let mut segments: Vec<String> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(FsError::InvalidArgument(format!(
                        "path escapes the root: {path}"
                    )));
                }
            }
            name => {
                if name.len() > NAME_MAX {
                    return Err(FsError::NameTooLong);
                }
                if name.contains('\0') {
                    return Err(FsError::InvalidArgument(format!(
                        "NUL byte in path: {path:?}"
                    )));
                }
                segments.push(name.to_owned());
            }
        }
    }
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_forms() {
        assert_eq!(normalize("/").expect("root"), Vec::<String>::new());
        assert_eq!(normalize("/.").expect("root"), Vec::<String>::new());
        assert_eq!(normalize("//").expect("root"), Vec::<String>::new());
        assert_eq!(normalize("/a/..").expect("root"), Vec::<String>::new());
    }

    #[test]
    fn segments_and_dot_handling() {
        assert_eq!(normalize("/a/b/c").expect("path"), vec!["a", "b", "c"]);
        assert_eq!(normalize("a/b").expect("path"), vec!["a", "b"]);
        assert_eq!(normalize("/a//b/./c").expect("path"), vec!["a", "b", "c"]);
        assert_eq!(normalize("/a/b/../c").expect("path"), vec!["a", "c"]);
    }

    #[test]
    fn invalid_paths_are_rejected() {
        assert!(matches!(
            normalize("").expect_err("empty"),
            FsError::InvalidArgument(_)
        ));
        assert!(matches!(
            normalize("/..").expect_err("escape"),
            FsError::InvalidArgument(_)
        ));
        assert!(matches!(
            normalize("/a/../../b").expect_err("escape"),
            FsError::InvalidArgument(_)
        ));
        assert!(matches!(
            normalize("/a\0b").expect_err("nul"),
            FsError::InvalidArgument(_)
        ));

        let long = format!("/{}", "x".repeat(NAME_MAX + 1));
        assert!(matches!(
            normalize(&long).expect_err("long"),
            FsError::NameTooLong
        ));
    }
}
