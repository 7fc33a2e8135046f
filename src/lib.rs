pub mod error;
pub mod consts;
pub mod hash;
pub mod manifest;
pub mod patch_archive;
pub mod classify;

pub mod tools {
    pub mod binary;
    pub mod text;
}

pub mod diff;
pub mod merge;
pub mod apply;
pub mod download;
pub mod orchestrator;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use super::error::*;
    pub use super::manifest::{Manifest, ManifestEntry, PatchKind};
    pub use super::patch_archive::PatchArchive;
    pub use super::classify::{classify, FileClass};
    pub use super::diff::DiffEngine;
    pub use super::merge::{MergeEngine, StagedOverlay};
    pub use super::apply::ApplyEngine;
    pub use super::tools::binary::{BinaryDiffTool, SystemBinaryDiffTool, StubBinaryDiffTool};
    pub use super::tools::text::{TextPatchTool, DiffMatchPatchTool, StubTextPatchTool};
    pub use super::download::{DownloadItem, DownloadLimit, DownloadRecord, DownloadStore, ResumableDownloader};
    pub use super::orchestrator::{Config, Job, UpdateOrchestrator, HostProcess, SystemHostProcess, ProcessWatcher, SystemProcessWatcher};
}
