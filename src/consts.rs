use std::time::Duration;

/// Name of the manifest entry inside a patch archive and inside a staged
/// overlay's own (much smaller) deletion-only manifest.
pub const CFG_NAME: &str = "cfg.json";

/// Subdirectory holding patch blobs for modified files (`patchfs/<relpath>`).
pub const PATCH_DIR: &str = "patchfs";

/// Subdirectory holding full content for newly introduced files
/// (`newfs/<relpath>`).
pub const NEW_DIR: &str = "newfs";

/// Subdirectory of a staged overlay holding the finalized content of every
/// touched file (`files/<relpath>`).
pub const MERGED_DIR: &str = "files";

/// Informational extension for a patch archive. The format is a zip
/// container regardless of the file's extension.
pub const PATCH_EXT: &str = "cpatch";

/// Extension used for an in-progress (partially downloaded) file.
pub const PARTIAL_EXT: &str = "par";

/// A download or staging-directory lock older than this is considered
/// abandoned and reclaimable.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Nominal block size used by [`crate::download::ResumableDownloader`] when
/// streaming a response to disk.
pub const DOWNLOAD_BLOCK_SIZE: usize = 8 * 1024;

/// Bound on the downloader's work queue (spec: "a bounded FIFO").
pub const DOWNLOAD_QUEUE_CAPACITY: usize = 256;

/// Manifest entry `type` tag for a binary patch produced by `bsdiff`.
pub const TYPE_BSDIFF: &str = "bsdiff";

/// Manifest entry `type` tag for a textual diff-match-patch blob.
pub const TYPE_TEXT: &str = "text";

/// Name of the sentinel lock file placed inside a staging directory.
pub const LOCK_FILE_NAME: &str = ".patchkit-lock";

/// Name of the durable [`crate::download::DownloadStore`] directory kept
/// alongside the patch archives a download session is staging.
pub const DOWNLOAD_STORE_DIR: &str = "downloads.sled";

/// Suffix appended to a frozen executable's clone while it finishes
/// applying a staged overlay to itself.
pub const PATCHER_CLONE_SUFFIX: &str = ".patcher";

/// Name of the crash-log file written next to the orchestrator config on an
/// unrecoverable error.
pub const CRASH_LOG_NAME: &str = "patcherr.log";

/// How long `waitForExit` polls before giving up and escalating to
/// [`crate::error::BrokenError`]. The Python original has no such bound.
pub const WAIT_FOR_EXIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between process-liveness checks while waiting for the old
/// binary to exit during a frozen-mode apply.
pub const WAIT_FOR_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
