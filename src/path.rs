use crate::error::{ArchiveError, Result};
use std::path::{Component, Path, PathBuf};

/// Turns an archive entry name into a relative path that stays below the
/// extraction directory. `\` counts as a separator; `.` parts are dropped.
pub fn entry_path(name: &str) -> Result<PathBuf> {
    let sanitized = name.replace('\\', "/");
    let mut out = PathBuf::new();

    for component in Path::new(&sanitized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArchiveError::InvalidFormat(format!(
                    "Entry '{}' escapes the output directory",
                    name
                )));
            }
        }
    }

    if out.as_os_str().is_empty() {
        return Err(ArchiveError::InvalidFormat(format!(
            "Entry '{}' has an empty path",
            name
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_pass_through() {
        assert_eq!(
            entry_path("bgm/title.hca").unwrap(),
            PathBuf::from("bgm").join("title.hca")
        );
        assert_eq!(
            entry_path("./chara\\motion/walk.gmt").unwrap(),
            PathBuf::from("chara").join("motion").join("walk.gmt")
        );
    }

    #[test]
    fn test_traversal_is_rejected() {
        for name in ["../x.bin", "data/../../x.bin", "..", "/etc/passwd", "\\abs.bin"] {
            assert!(
                matches!(entry_path(name), Err(ArchiveError::InvalidFormat(_))),
                "{} was accepted",
                name
            );
        }
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(entry_path("").is_err());
        assert!(entry_path("./.").is_err());
    }
}
