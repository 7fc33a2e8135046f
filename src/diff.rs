use std::fs;
use std::path::{Path, PathBuf};

use crate::classify::{classify, FileClass};
use crate::consts::{CFG_NAME, PATCH_DIR, NEW_DIR};
use crate::error::DiffError;
use crate::hash::md5_file;
use crate::manifest::{Manifest, ManifestEntry, PatchKind};
use crate::patch_archive::PatchArchive;
use crate::tools::binary::BinaryDiffTool;
use crate::tools::text::TextPatchTool;

/// Produces a [`PatchArchive`] from `(old_dir, new_dir)`.
///
/// Walks `new_dir` deterministically; every file absent from `old_dir`
/// becomes a `newfs/` entry, every file present in both is classified
/// text-vs-binary and diffed accordingly, and every file present in
/// `old_dir` but not `new_dir` is recorded as a deletion.
pub struct DiffEngine<B, T> {
    binary_tool: B,
    text_tool: T
}

impl<B: BinaryDiffTool, T: TextPatchTool> DiffEngine<B, T> {
    pub fn new(binary_tool: B, text_tool: T) -> Self {
        Self { binary_tool, text_tool }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn diff(&self, old_dir: &Path, new_dir: &Path, archive_path: &Path) -> Result<(), DiffError> {
        let staging = tempfile::tempdir().map_err(DiffError::Spawn)?;
        let staging = staging.path();

        let mut manifest = Manifest::new();

        for new_file in walk_files(new_dir)? {
            let relpath = Manifest::to_relpath(
                new_file.strip_prefix(new_dir).expect("walked entry is under new_dir")
            );

            let old_file = old_dir.join(&relpath);

            if !old_file.is_file() {
                self.record_new_file(staging, &new_file, &relpath, &mut manifest)?;
                continue;
            }

            match classify(&new_file)? {
                FileClass::Text => self.record_text_patch(staging, &old_file, &new_file, &relpath, &mut manifest)?,
                FileClass::Binary => self.record_binary_patch(staging, &old_file, &new_file, &relpath, &mut manifest)?
            }
        }

        for old_file in walk_files(old_dir)? {
            let relpath = Manifest::to_relpath(
                old_file.strip_prefix(old_dir).expect("walked entry is under old_dir")
            );

            if !new_dir.join(&relpath).is_file() {
                manifest.deleted.push(relpath);
            }
        }

        fs::write(staging.join(CFG_NAME), manifest.to_json()?)?;

        PatchArchive::write(staging, archive_path)?;

        Ok(())
    }

    fn record_new_file(&self, staging: &Path, new_file: &Path, relpath: &str, manifest: &mut Manifest) -> Result<(), DiffError> {
        let dest = staging.join(NEW_DIR).join(relpath);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::copy(new_file, &dest)?;

        manifest.entries.insert(relpath.to_string(), ManifestEntry::New {
            patchedmd5: md5_file(new_file)?
        });

        Ok(())
    }

    fn record_text_patch(&self, staging: &Path, old_file: &Path, new_file: &Path, relpath: &str, manifest: &mut Manifest) -> Result<(), DiffError> {
        let old_text = fs::read_to_string(old_file)?;
        let new_text = fs::read_to_string(new_file)?;

        let patch_blob = self.text_tool.make_patch(&old_text, &new_text)?;

        let dest = staging.join(PATCH_DIR).join(relpath);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&dest, patch_blob)?;

        manifest.entries.insert(relpath.to_string(), ManifestEntry::Patched {
            kind: PatchKind::Text,
            oldmd5: md5_file(old_file)?,
            patchedmd5: md5_file(new_file)?
        });

        Ok(())
    }

    fn record_binary_patch(&self, staging: &Path, old_file: &Path, new_file: &Path, relpath: &str, manifest: &mut Manifest) -> Result<(), DiffError> {
        let dest = staging.join(PATCH_DIR).join(relpath);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        self.binary_tool.diff(old_file, new_file, &dest)?;

        manifest.entries.insert(relpath.to_string(), ManifestEntry::Patched {
            kind: PatchKind::Bsdiff,
            oldmd5: md5_file(old_file)?,
            patchedmd5: md5_file(new_file)?
        });

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
        let mut entries: Vec<_> = fs::read_dir(dir)?.filter_map(Result::ok).collect();

        // Deterministic walk order, matching the spec's "walk ... deterministically".
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
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
    use crate::tools::binary::StubBinaryDiffTool;
    use crate::tools::text::StubTextPatchTool;

    fn engine() -> DiffEngine<StubBinaryDiffTool, StubTextPatchTool> {
        DiffEngine::new(StubBinaryDiffTool, StubTextPatchTool)
    }

    #[test]
    fn diffs_new_text_and_deleted_files() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();

        fs::write(old.path().join("patched.file"), "some text").unwrap();
        fs::write(old.path().join("deleted.file"), "bye").unwrap();

        fs::write(new.path().join("patched.file"), "some more text").unwrap();
        fs::write(new.path().join("new.file"), "some text").unwrap();

        let archive_path = tempfile::tempdir().unwrap().path().join("out.cpatch");

        engine().diff(old.path(), new.path(), &archive_path).expect("diff");

        let extract_dir = tempfile::tempdir().unwrap();
        let manifest = PatchArchive::extract(&archive_path, extract_dir.path()).expect("extract");

        assert!(manifest.is_new("new.file"));
        assert!(matches!(manifest.entry("patched.file"), Some(ManifestEntry::Patched { kind: PatchKind::Text, .. })));
        assert_eq!(manifest.deleted, vec!["deleted.file".to_string()]);
    }

    #[test]
    fn classifies_binary_files() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();

        fs::write(old.path().join("patched.file"), b"\x00This is \x00a binary file").unwrap();
        fs::write(new.path().join("patched.file"), b"\x00This is \x00a newer binary file").unwrap();

        let archive_path = tempfile::tempdir().unwrap().path().join("out.cpatch");

        engine().diff(old.path(), new.path(), &archive_path).expect("diff");

        let extract_dir = tempfile::tempdir().unwrap();
        let manifest = PatchArchive::extract(&archive_path, extract_dir.path()).expect("extract");

        assert!(matches!(manifest.entry("patched.file"), Some(ManifestEntry::Patched { kind: PatchKind::Bsdiff, .. })));
    }
}
