use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zip::{ZipArchive, ZipWriter};
use zip::write::SimpleFileOptions;

use crate::consts::{CFG_NAME, PATCH_DIR, NEW_DIR};
use crate::error::{DiffError, PatchError};
use crate::manifest::{Manifest, ManifestEntry};

/// Reader/writer for the on-disk patch archive layout: a zip container
/// holding `cfg.json`, `patchfs/<relpath>` patch blobs and `newfs/<relpath>`
/// full replacement files.
///
/// `PatchArchive` itself is immutable once written (§3 Lifecycles); this
/// type is just the (de)serialization boundary between that zip container
/// and a plain directory tree shaped the same way.
pub struct PatchArchive;

impl PatchArchive {
    /// Write a directory shaped like `{cfg.json, patchfs/, newfs/}` into a
    /// zip archive at `archive_path`.
    ///
    /// Rejects directories that violate the invariants in §3: every
    /// `patchfs/` entry must have a manifest entry with both `oldmd5` and
    /// `type`; every `newfs/` entry must have a manifest entry with
    /// `patchedmd5` and no `type`; `deleted` and `patchfs ∪ newfs` must be
    /// disjoint.
    pub fn write(dir: impl AsRef<Path>, archive_path: impl AsRef<Path>) -> Result<(), DiffError> {
        let dir = dir.as_ref();

        let manifest_bytes = fs::read(dir.join(CFG_NAME))?;
        let manifest = Manifest::from_json(&manifest_bytes)?;

        Self::validate(dir, &manifest)?;

        let file = File::create(archive_path.as_ref())?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        writer.start_file(CFG_NAME, options)?;
        writer.write_all(&manifest_bytes)?;

        for sub in [PATCH_DIR, NEW_DIR] {
            let root = dir.join(sub);

            if !root.is_dir() {
                continue;
            }

            for entry in walk(&root)? {
                let relative = entry.strip_prefix(dir)
                    .expect("walked entry is under dir")
                    .to_string_lossy()
                    .replace('\\', "/");

                writer.start_file(relative, options)?;
                writer.write_all(&fs::read(&entry)?)?;
            }
        }

        writer.finish()?;

        Ok(())
    }

    fn validate(dir: &Path, manifest: &Manifest) -> Result<(), DiffError> {
        for sub in [PATCH_DIR, NEW_DIR] {
            let root = dir.join(sub);

            if !root.is_dir() {
                continue;
            }

            for entry in walk(&root)? {
                let relpath = entry.strip_prefix(&root)
                    .expect("walked entry is under root")
                    .to_string_lossy()
                    .replace('\\', "/");

                match (sub, manifest.entry(&relpath)) {
                    (PATCH_DIR, Some(ManifestEntry::Patched { .. })) => {},
                    (NEW_DIR, Some(ManifestEntry::New { .. })) => {},

                    _ => return Err(DiffError::TextPatch(
                        entry,
                        format!("{relpath} has no matching manifest entry of the expected shape")
                    ))
                }
            }
        }

        let deleted: std::collections::HashSet<&str> = manifest.deleted
            .iter()
            .map(String::as_str)
            .collect();

        for key in manifest.entries.keys() {
            if deleted.contains(key.as_str()) {
                return Err(DiffError::TextPatch(
                    PathBuf::from(key),
                    "path appears in both `deleted` and the patch/new set".to_string()
                ));
            }
        }

        Ok(())
    }

    /// Extract a patch archive to `dest_dir`. Tolerates archives missing
    /// `patchfs/` and/or `newfs/` entirely (an archive may contain only new
    /// files, only patches, or only deletions).
    pub fn extract(archive_path: impl AsRef<Path>, dest_dir: impl AsRef<Path>) -> Result<Manifest, PatchError> {
        let dest_dir = dest_dir.as_ref();
        let file = File::open(archive_path.as_ref())?;
        let mut zip = ZipArchive::new(file)?;

        fs::create_dir_all(dest_dir)?;

        let mut manifest = None;

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;

            let Some(name) = entry.enclosed_name() else {
                continue;
            };

            let out_path = dest_dir.join(&name);

            if entry.is_dir() {
                fs::create_dir_all(&out_path)?;
                continue;
            }

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }

            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;

            if name == Path::new(CFG_NAME) {
                manifest = Some(Manifest::from_json(&buf)?);
            }

            fs::write(&out_path, &buf)?;
        }

        Ok(manifest.unwrap_or_default())
    }
}

fn walk(root: &Path) -> std::io::Result<Vec<PathBuf>> {
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
