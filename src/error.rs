use std::path::PathBuf;

/// Top-level error returned by every public boundary of this crate.
///
/// Mirrors the error kinds named in the spec's error handling design:
/// `DiffError`, `PatchError`, `LockError`, the generic `Error`, and
/// `BrokenError`. Lower-level errors (`io`, `serde_json`, `minreq`, `sled`,
/// `zip`) are wrapped rather than converted to strings so callers can match
/// on them if they need to.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("diff failed for {path}: {source}")]
    Diff {
        path: PathBuf,

        #[source]
        source: DiffError
    },

    #[error("patch failed for {path}: {source}")]
    Patch {
        path: PathBuf,

        #[source]
        source: PatchError
    },

    #[error("staging directory is locked: {0}")]
    Lock(#[from] LockError),

    #[error("operational error: {0}")]
    Operational(#[from] OperationalError),

    #[error("update process is broken and must not be retried: {0}")]
    Broken(#[from] BrokenError)
}

/// Failure of the external diff tool (binary or text) while producing an
/// archive. Never sets the orchestrator's `broken` flag.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("bsdiff exited with a non-zero status ({status}) while diffing {old} -> {new}")]
    BsdiffFailed {
        old: PathBuf,
        new: PathBuf,
        status: String
    },

    #[error("failed to spawn external diff tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("failed to build text patch for {0}: {1}")]
    TextPatch(PathBuf, String),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error)
}

/// Integrity or merge failure raised while folding patch archives against
/// a live source tree. Surfaced as [`UpdateError::Patch`] to the online
/// phase and always leaves the source tree untouched.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("{path} is listed in the manifest but missing on disk")]
    MissingSourceFile { path: PathBuf },

    #[error("{path} failed its pre-patch integrity check (expected md5 {expected}, found {actual})")]
    HashMismatchBeforePatch {
        path: PathBuf,
        expected: String,
        actual: String
    },

    #[error("{path} failed its post-patch integrity check (expected md5 {expected}, found {actual})")]
    HashMismatchAfterPatch {
        path: PathBuf,
        expected: String,
        actual: String
    },

    #[error("bspatch exited with a non-zero status ({status}) while patching {path}")]
    BspatchFailed { path: PathBuf, status: String },

    #[error("text patch for {path} had a failing hunk")]
    TextPatchHunkFailed { path: PathBuf },

    #[error("unknown manifest entry type {0:?} for {1}")]
    UnknownType(String, PathBuf),

    #[error("failed to spawn external patch tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error)
}

/// The staging directory used by [`crate::download::ResumableDownloader`]
/// is already held by another instance.
#[derive(Debug, thiserror::Error)]
#[error("staging directory {path} is locked (held since {held_since:?})")]
pub struct LockError {
    pub path: PathBuf,
    pub held_since: Option<std::time::SystemTime>
}

/// Recoverable operational failure: bad paths, filesystem issues, network
/// errors. The caller may retry.
#[derive(Debug, thiserror::Error)]
pub enum OperationalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] minreq::Error),

    #[error("download store error: {0}")]
    Store(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    Other(String)
}

/// The update process is in an indeterminate state. Once raised, the
/// orchestrator persists `broken = true` and refuses all further actions;
/// the host program must still be allowed to start normally.
#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct BrokenError {
    pub reason: String
}

impl BrokenError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}
