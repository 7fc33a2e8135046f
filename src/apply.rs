use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BrokenError, OperationalError};
use crate::merge::StagedOverlay;

/// Moves a [`StagedOverlay`] into the live source tree and executes its
/// deletions.
///
/// Step 1 (moving patched content in) is fatal on failure: the source tree
/// is left in an indeterminate state and [`BrokenError`] is raised. Step 2
/// (deletions) is non-fatal; missing targets are tolerated since a
/// previous, interrupted run may already have removed them.
pub struct ApplyEngine;

impl ApplyEngine {
    #[tracing::instrument(level = "info")]
    pub fn apply(source: &Path, overlay: &StagedOverlay) -> Result<(), BrokenError> {
        Self::move_files(source, overlay)
            .map_err(|err| BrokenError::new(format!(
                "source tree at {} is in an indeterminate state after a failed apply: {err}",
                source.display()
            )))?;

        for relpath in &overlay.deleted {
            let target = source.join(relpath);

            if let Err(err) = fs::remove_file(&target) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %target.display(), %err, "failed to remove deleted file (non-fatal)");
                }
            }
        }

        Ok(())
    }

    fn move_files(source: &Path, overlay: &StagedOverlay) -> Result<(), OperationalError> {
        for entry in walk_files(&overlay.files_dir())? {
            let relpath = entry.strip_prefix(overlay.files_dir())
                .expect("walked entry is under the overlay's files dir");

            let target = source.join(relpath);

            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }

            if target.is_file() {
                fs::remove_file(&target)?;
            }

            fs::rename(&entry, &target).or_else(|_| {
                // Cross-filesystem overlay/source: fall back to copy + remove.
                fs::copy(&entry, &target)?;
                fs::remove_file(&entry)
            })?;
        }

        Ok(())
    }
}

fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();

    if !root.is_dir() {
        return Ok(out);
    }

    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::{CFG_NAME, MERGED_DIR};
    use crate::manifest::Manifest;

    fn make_overlay(deleted: Vec<&str>, files: &[(&str, &str)]) -> (tempfile::TempDir, StagedOverlay) {
        let dir = tempfile::tempdir().unwrap();

        for (path, content) in files {
            let full = dir.path().join(MERGED_DIR).join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }

        let manifest = Manifest { deleted: deleted.iter().map(|s| s.to_string()).collect(), entries: Default::default() };
        fs::write(dir.path().join(CFG_NAME), manifest.to_json().unwrap()).unwrap();

        let overlay = StagedOverlay { root: dir.path().to_path_buf(), deleted: deleted.into_iter().map(String::from).collect() };

        (dir, overlay)
    }

    #[test]
    fn moves_files_and_removes_deletions() {
        let source = tempfile::tempdir().unwrap();

        fs::write(source.path().join("old.txt"), "stale").unwrap();

        let (_overlay_dir, overlay) = make_overlay(vec!["old.txt"], &[("new.txt", "fresh")]);

        ApplyEngine::apply(source.path(), &overlay).unwrap();

        assert_eq!(fs::read_to_string(source.path().join("new.txt")).unwrap(), "fresh");
        assert!(!source.path().join("old.txt").exists());
    }

    #[test]
    fn tolerates_already_deleted_targets() {
        let source = tempfile::tempdir().unwrap();

        let (_overlay_dir, overlay) = make_overlay(vec!["already-gone.txt"], &[]);

        // Should not error even though the file never existed.
        ApplyEngine::apply(source.path(), &overlay).unwrap();
    }

    #[test]
    fn overwrites_existing_target_file() {
        let source = tempfile::tempdir().unwrap();

        fs::write(source.path().join("f"), "old content").unwrap();

        let (_overlay_dir, overlay) = make_overlay(vec![], &[("f", "new content")]);

        ApplyEngine::apply(source.path(), &overlay).unwrap();

        assert_eq!(fs::read_to_string(source.path().join("f")).unwrap(), "new content");
    }
}
