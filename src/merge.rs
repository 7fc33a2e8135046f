use std::fs;
use std::path::{Path, PathBuf};

use crate::consts::{CFG_NAME, PATCH_DIR, NEW_DIR, MERGED_DIR};
use crate::error::PatchError;
use crate::hash::md5_file;
use crate::manifest::{Manifest, ManifestEntry, PatchKind};
use crate::patch_archive::PatchArchive;
use crate::tools::binary::BinaryDiffTool;
use crate::tools::text::TextPatchTool;

/// Result of folding an ordered sequence of patch archives against a live
/// source tree: a directory mirroring the eventual target layout plus the
/// accumulated deletion set, ready for [`crate::apply::ApplyEngine`].
pub struct StagedOverlay {
    /// Root of the overlay directory (contains `files/` and `cfg.json`).
    pub root: PathBuf,

    /// Accumulated deletion set, with paths re-created by a later archive
    /// already removed.
    pub deleted: Vec<String>
}

impl StagedOverlay {
    pub fn files_dir(&self) -> PathBuf {
        self.root.join(MERGED_DIR)
    }
}

/// Folds an ordered sequence of patch archives against a read-only source
/// directory into a single [`StagedOverlay`].
///
/// Patches are applied in the exact order supplied. Text and binary
/// patches never chain through the binary format: intermediate state lives
/// on disk as full file content in `overlay/files/`, so archive `i+1`
/// always reads the fully materialized output of archive `i`. This avoids
/// requiring the external diff tools to support chained deltas.
#[derive(Clone, Copy)]
pub struct MergeEngine<B, T> {
    binary_tool: B,
    text_tool: T
}

impl<B: BinaryDiffTool, T: TextPatchTool> MergeEngine<B, T> {
    pub fn new(binary_tool: B, text_tool: T) -> Self {
        Self { binary_tool, text_tool }
    }

    #[tracing::instrument(level = "info", skip(self, archives))]
    pub fn merge(&self, source: &Path, output: &Path, archives: &[PathBuf]) -> Result<StagedOverlay, PatchError> {
        fs::create_dir_all(output.join(MERGED_DIR))?;

        let mut deleted: Vec<String> = Vec::new();

        for archive in archives {
            self.fold_one(source, output, archive, &mut deleted)?;
        }

        fs::write(output.join(CFG_NAME), Manifest {
            deleted: deleted.clone(),
            entries: Default::default()
        }.to_json()?)?;

        Ok(StagedOverlay { root: output.to_path_buf(), deleted })
    }

    fn fold_one(&self, source: &Path, output: &Path, archive: &Path, deleted: &mut Vec<String>) -> Result<(), PatchError> {
        let staging = tempfile::tempdir()?;
        let staging = staging.path();

        let manifest = PatchArchive::extract(archive, staging)?;
        let files_dir = output.join(MERGED_DIR);

        // New files overwrite any previous overlay copy and resurrect a
        // path previously marked for deletion.
        let new_root = staging.join(NEW_DIR);

        if new_root.is_dir() {
            for entry in walk_files(&new_root)? {
                let relpath = Manifest::to_relpath(
                    entry.strip_prefix(&new_root).expect("walked entry is under new_root")
                );

                let dest = files_dir.join(&relpath);

                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }

                fs::copy(&entry, &dest)?;

                deleted.retain(|d| d != &relpath);
            }
        }

        // Existing-file patches, dispatched by manifest type.
        let patch_root = staging.join(PATCH_DIR);

        if patch_root.is_dir() {
            for entry in walk_files(&patch_root)? {
                let relpath = Manifest::to_relpath(
                    entry.strip_prefix(&patch_root).expect("walked entry is under patch_root")
                );

                self.apply_one_patch(source, &files_dir, &entry, &relpath, &manifest)?;
            }
        }

        // A file patched earlier in this same source sequence and then
        // deleted by this archive must not survive in the overlay, even
        // though it must still be recorded so ApplyEngine removes the
        // copy in the source tree.
        for path in &manifest.deleted {
            let overlay_copy = files_dir.join(path);

            if overlay_copy.is_file() {
                fs::remove_file(&overlay_copy)?;
            }
        }

        deleted.extend(manifest.deleted);

        Ok(())
    }

    fn apply_one_patch(&self, source: &Path, files_dir: &Path, patch_blob: &Path, relpath: &str, manifest: &Manifest) -> Result<(), PatchError> {
        let entry = manifest.entry(relpath).ok_or_else(|| PatchError::UnknownType(
            "<missing manifest entry>".to_string(),
            PathBuf::from(relpath)
        ))?;

        let ManifestEntry::Patched { kind, oldmd5, patchedmd5 } = entry else {
            return Err(PatchError::UnknownType("new".to_string(), PathBuf::from(relpath)));
        };

        let overlay_path = files_dir.join(relpath);

        let to_patch = if overlay_path.is_file() {
            overlay_path.clone()
        } else {
            source.join(relpath)
        };

        if !to_patch.is_file() {
            return Err(PatchError::MissingSourceFile { path: to_patch });
        }

        let actual = md5_file(&to_patch)?;

        if &actual != oldmd5 {
            return Err(PatchError::HashMismatchBeforePatch {
                path: to_patch,
                expected: oldmd5.clone(),
                actual
            });
        }

        if let Some(parent) = overlay_path.parent() {
            fs::create_dir_all(parent)?;
        }

        match kind {
            PatchKind::Bsdiff => {
                self.binary_tool.patch(&to_patch, &overlay_path, patch_blob)?;
            },
            PatchKind::Text => {
                let text = fs::read_to_string(&to_patch)?;
                let blob = fs::read_to_string(patch_blob)?;

                let (patched, hunks) = self.text_tool.apply_patch(&blob, &text)
                    .map_err(|_| PatchError::TextPatchHunkFailed { path: to_patch.clone() })?;

                if !hunks.iter().all(|&ok| ok) {
                    return Err(PatchError::TextPatchHunkFailed { path: to_patch.clone() });
                }

                fs::write(&overlay_path, patched)?;
            }
        }

        let result_md5 = md5_file(&overlay_path)?;

        if &result_md5 != patchedmd5 {
            return Err(PatchError::HashMismatchAfterPatch {
                path: overlay_path,
                expected: patchedmd5.clone(),
                actual: result_md5
            });
        }

        Ok(())
    }
}

fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
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
    use crate::apply::ApplyEngine;
    use crate::diff::DiffEngine;
    use crate::tools::binary::StubBinaryDiffTool;
    use crate::tools::text::StubTextPatchTool;

    fn diff_engine() -> DiffEngine<StubBinaryDiffTool, StubTextPatchTool> {
        DiffEngine::new(StubBinaryDiffTool, StubTextPatchTool)
    }

    fn merge_engine() -> MergeEngine<StubBinaryDiffTool, StubTextPatchTool> {
        MergeEngine::new(StubBinaryDiffTool, StubTextPatchTool)
    }

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }

        fs::write(path, content).unwrap();
    }

    /// Scenario 1: new file.
    #[test]
    fn new_file_appears_after_apply() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();

        write(new.path(), "new.file", "some text");

        let archive = tempfile::tempdir().unwrap().path().join("p1.cpatch");
        diff_engine().diff(old.path(), new.path(), &archive).unwrap();

        let out = tempfile::tempdir().unwrap();
        let overlay = merge_engine().merge(old.path(), out.path(), &[archive]).unwrap();

        assert_eq!(fs::read_to_string(overlay.files_dir().join("new.file")).unwrap(), "some text");
        assert!(overlay.deleted.is_empty());
    }

    /// Scenario 2: text patch.
    #[test]
    fn text_patch_applies() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();

        write(old.path(), "patched.file", "some text");
        write(new.path(), "patched.file", "some more text");

        let archive = tempfile::tempdir().unwrap().path().join("p1.cpatch");
        diff_engine().diff(old.path(), new.path(), &archive).unwrap();

        let out = tempfile::tempdir().unwrap();
        let overlay = merge_engine().merge(old.path(), out.path(), &[archive]).unwrap();

        assert_eq!(fs::read_to_string(overlay.files_dir().join("patched.file")).unwrap(), "some more text");
    }

    /// Scenario 3: binary patch round-trips byte-for-byte all the way
    /// through `DiffEngine` -> `MergeEngine` -> `ApplyEngine`, not just the
    /// staged overlay.
    #[test]
    fn binary_patch_round_trips_byte_for_byte_through_apply() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();

        let old_bytes: &[u8] = b"\x00\x01\x02 old binary payload \x00\x01\x02";
        let new_bytes: &[u8] = b"\x00\x01\x02 new binary payload, a bit longer \x00\x01\x02";

        fs::write(old.path().join("blob.bin"), old_bytes).unwrap();
        fs::write(new.path().join("blob.bin"), new_bytes).unwrap();

        let archive = tempfile::tempdir().unwrap().path().join("p1.cpatch");
        diff_engine().diff(old.path(), new.path(), &archive).unwrap();

        let out = tempfile::tempdir().unwrap();
        let overlay = merge_engine().merge(old.path(), out.path(), &[archive]).unwrap();

        assert_eq!(fs::read(overlay.files_dir().join("blob.bin")).unwrap(), new_bytes);

        let live = tempfile::tempdir().unwrap();
        fs::write(live.path().join("blob.bin"), old_bytes).unwrap();

        ApplyEngine::apply(live.path(), &overlay).unwrap();

        assert_eq!(fs::read(live.path().join("blob.bin")).unwrap(), new_bytes);
    }

    /// Scenario 4: two-step chain.
    #[test]
    fn chained_patches_apply_in_order() {
        let d0 = tempfile::tempdir().unwrap();
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();

        write(d0.path(), "patched.file", "This is some text0");
        write(d1.path(), "patched.file", "This is some text1");
        write(d2.path(), "patched.file", "This is some text2");

        let p1 = tempfile::tempdir().unwrap().path().join("p1.cpatch");
        let p2 = tempfile::tempdir().unwrap().path().join("p2.cpatch");

        diff_engine().diff(d0.path(), d1.path(), &p1).unwrap();
        diff_engine().diff(d1.path(), d2.path(), &p2).unwrap();

        let out = tempfile::tempdir().unwrap();
        let overlay = merge_engine().merge(d0.path(), out.path(), &[p1, p2]).unwrap();

        assert_eq!(fs::read_to_string(overlay.files_dir().join("patched.file")).unwrap(), "This is some text2");
    }

    /// Scenario 5: resurrection.
    #[test]
    fn recreated_file_is_not_left_in_deletion_set() {
        let d0 = tempfile::tempdir().unwrap();
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();

        write(d0.path(), "a.txt", "original");
        // d1 has no a.txt -> diff(d0, d1) records a deletion.
        write(d2.path(), "a.txt", "resurrected");

        let p1 = tempfile::tempdir().unwrap().path().join("p1.cpatch");
        let p2 = tempfile::tempdir().unwrap().path().join("p2.cpatch");

        diff_engine().diff(d0.path(), d1.path(), &p1).unwrap();
        diff_engine().diff(d1.path(), d2.path(), &p2).unwrap();

        let out = tempfile::tempdir().unwrap();
        let overlay = merge_engine().merge(d0.path(), out.path(), &[p1, p2]).unwrap();

        assert_eq!(fs::read_to_string(overlay.files_dir().join("a.txt")).unwrap(), "resurrected");
        assert!(!overlay.deleted.contains(&"a.txt".to_string()));
    }

    /// Scenario 6: integrity guard.
    #[test]
    fn tampered_source_file_fails_merge_and_leaves_source_untouched() {
        let old = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();

        write(old.path(), "f", "some text");
        write(new.path(), "f", "some more text");

        let archive = tempfile::tempdir().unwrap().path().join("p1.cpatch");
        diff_engine().diff(old.path(), new.path(), &archive).unwrap();

        // Tamper with the live source after the archive was generated.
        write(old.path(), "f", "some text, but tampered");

        let out = tempfile::tempdir().unwrap();
        let result = merge_engine().merge(old.path(), out.path(), &[archive]);

        assert!(matches!(result, Err(PatchError::HashMismatchBeforePatch { .. })));
        assert_eq!(fs::read_to_string(old.path().join("f")).unwrap(), "some text, but tampered");
    }

    /// A file patched then later deleted must not remain in the overlay,
    /// but must still be recorded for ApplyEngine to remove from source.
    #[test]
    fn patch_then_delete_removes_overlay_copy_but_keeps_deletion() {
        let d0 = tempfile::tempdir().unwrap();
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();

        write(d0.path(), "f", "v0");
        write(d1.path(), "f", "v1");
        // d2 has no f -> deleted by P2.

        let p1 = tempfile::tempdir().unwrap().path().join("p1.cpatch");
        let p2 = tempfile::tempdir().unwrap().path().join("p2.cpatch");

        diff_engine().diff(d0.path(), d1.path(), &p1).unwrap();
        diff_engine().diff(d1.path(), d2.path(), &p2).unwrap();

        let out = tempfile::tempdir().unwrap();
        let overlay = merge_engine().merge(d0.path(), out.path(), &[p1, p2]).unwrap();

        assert!(!overlay.files_dir().join("f").exists());
        assert!(overlay.deleted.contains(&"f".to_string()));
    }
}
