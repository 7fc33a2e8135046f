use std::fs;
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};

use crate::error::OperationalError;

/// The `job` the offline phase is responsible for, per §4.7's state table.
/// The config's *absence* of a `job` field (or of the file itself) means
/// idle — there is deliberately no `Job::Idle` variant; callers check
/// `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Job {
    RunPatch,
    ApplyBinPatch
}

/// The single source of truth the whole state machine is driven by. Every
/// write replaces the file wholesale (§4.7 "all writes ... are whole-file
/// replacements"); readers never see a partially-written document because
/// writes land via a temp-file-then-rename.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Job>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srcdir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patchdir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldbin: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curdl: Option<Vec<String>>,

    #[serde(default)]
    pub broken: bool
}

impl Config {
    /// A missing config file means "idle" (§3 Lifecycles): this returns the
    /// all-`None`, `broken: false` default rather than an error.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, OperationalError> {
        let path = path.as_ref();

        if !path.is_file() {
            return Ok(Self::default());
        }

        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    /// Whole-file replacement via a sibling temp file plus rename so a
    /// crash mid-write can never leave `path` holding a truncated or
    /// half-written document.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), OperationalError> {
        let path = path.as_ref();
        let tmp_path = path.with_extension("cfg.tmp");

        fs::write(&tmp_path, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp_path, path)?;

        Ok(())
    }

    /// Remove the config file, tolerating its absence (another run may
    /// already have deleted it).
    pub fn delete(path: impl AsRef<Path>) -> Result<(), OperationalError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_idle_default() {
        let dir = tempfile::tempdir().unwrap();

        let cfg = Config::read(dir.path().join("patch.cfg")).unwrap();

        assert_eq!(cfg, Config::default());
        assert!(!cfg.broken);
        assert!(cfg.job.is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch.cfg");

        let cfg = Config {
            job: Some(Job::RunPatch),
            srcdir: Some(PathBuf::from("/src")),
            patchdir: Some(PathBuf::from("/patch")),
            oldbin: None,
            curdl: None,
            broken: false
        };

        cfg.write(&path).unwrap();

        let read_back = Config::read(&path).unwrap();

        assert_eq!(read_back, cfg);
    }

    #[test]
    fn job_serializes_without_separators() {
        let cfg = Config { job: Some(Job::ApplyBinPatch), ..Config::default() };

        let json = serde_json::to_string(&cfg).unwrap();

        assert!(json.contains("\"job\":\"applybinpatch\""));
    }

    #[test]
    fn delete_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();

        assert!(Config::delete(dir.path().join("nonexistent.cfg")).is_ok());
    }

    #[test]
    fn write_survives_a_preexisting_tmp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch.cfg");

        fs::write(path.with_extension("cfg.tmp"), b"stale leftovers").unwrap();

        let cfg = Config { broken: true, ..Config::default() };
        cfg.write(&path).unwrap();

        assert_eq!(Config::read(&path).unwrap(), cfg);
    }
}
