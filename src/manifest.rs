use std::collections::HashMap;
use std::path::Path;

use serde::{Serialize, Deserialize};

use crate::consts::{TYPE_BSDIFF, TYPE_TEXT};

/// Tag stored verbatim in a manifest entry, chosen once during diffing and
/// switched on by the merge engine. A plain enum instead of the teacher's
/// dynamic dispatch-on-extension pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Text,
    Bsdiff
}

impl PatchKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => TYPE_TEXT,
            Self::Bsdiff => TYPE_BSDIFF
        }
    }
}

/// One `cfg.json` entry. A patched file carries `old_md5`/`kind`; a newly
/// introduced file carries neither (§3 invariant: `newfs/` entries have
/// `patchedmd5` only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ManifestEntry {
    Patched {
        #[serde(rename = "type")]
        kind: PatchKind,

        oldmd5: String,
        patchedmd5: String
    },
    New {
        patchedmd5: String
    }
}

impl ManifestEntry {
    pub fn patched_md5(&self) -> &str {
        match self {
            Self::Patched { patchedmd5, .. } |
            Self::New { patchedmd5 } => patchedmd5
        }
    }
}

/// Parsed form of a patch archive's `cfg.json`, or of a staged overlay's
/// much smaller deletion-only manifest (in which case `entries` is empty).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub deleted: Vec<String>,

    #[serde(flatten)]
    pub entries: HashMap<String, ManifestEntry>
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, relpath: &str) -> Option<&ManifestEntry> {
        self.entries.get(relpath)
    }

    pub fn is_new(&self, relpath: &str) -> bool {
        matches!(self.entries.get(relpath), Some(ManifestEntry::New { .. }))
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Normalize a filesystem path to the archive's POSIX-style relative
    /// path representation (forward slashes, never a leading `/`).
    pub fn to_relpath(path: &Path) -> String {
        path.to_string_lossy()
            .replace('\\', "/")
            .trim_start_matches('/')
            .to_string()
    }
}
