use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

pub fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        let env = std::env::current_dir().unwrap();
        env.join(path)
    }
}

/// Replaces `path` atomically: the content is written to a temporary sibling
/// file, synced, and renamed over the target. Readers either see the old
/// document or the new one, never a partial write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));

    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("Cannot create temporary file {}", tmp.display()))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Cannot replace {}", path.display()))?;
    Ok(())
}

/// Path of the currently running binary, usable for resubmitting handler jobs.
pub fn current_binary_path() -> anyhow::Result<PathBuf> {
    let path = std::env::current_exe().context("Cannot resolve the current binary")?;
    Ok(normalize_exe_path(path))
}

/// If the binary was replaced on disk while running, the kernel reports its
/// path with a ` (deleted)` suffix. Strip it so the path stays submittable.
pub fn normalize_exe_path(path: PathBuf) -> PathBuf {
    const DELETED_SUFFIX: &str = " (deleted)";
    match path.to_str() {
        Some(str) if str.ends_with(DELETED_SUFFIX) => {
            PathBuf::from(&str[..str.len() - DELETED_SUFFIX.len()])
        }
        _ => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = TempDir::new("fs").unwrap();
        let path = dir.path().join("data");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn normalize_deleted_path() {
        assert_eq!(
            normalize_exe_path(PathBuf::from("/a/b/c/escalade (deleted)")),
            PathBuf::from("/a/b/c/escalade")
        );
        assert_eq!(
            normalize_exe_path(PathBuf::from("/a/b/c/escalade")),
            PathBuf::from("/a/b/c/escalade")
        );
    }
}
