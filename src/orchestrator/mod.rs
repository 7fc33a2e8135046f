pub mod config;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use crate::consts::{CRASH_LOG_NAME, DOWNLOAD_STORE_DIR, PATCH_EXT, PARTIAL_EXT, PATCHER_CLONE_SUFFIX, WAIT_FOR_EXIT_POLL_INTERVAL, WAIT_FOR_EXIT_TIMEOUT};
use crate::download::{DownloadItem, DownloadLimit, DownloadStore, ResumableDownloader};
use crate::error::{BrokenError, OperationalError, UpdateError};
use crate::hash::md5_bytes;
use crate::merge::MergeEngine;
use crate::tools::binary::BinaryDiffTool;
use crate::tools::text::TextPatchTool;

pub use config::{Config, Job};

/// Abstracts the platform/packaging-specific half of §4.7: whether the host
/// is frozen, and how to clone/spawn/relaunch it. `System*` spawns real
/// child processes; `Stub*` records calls for orchestrator-logic tests
/// without ever actually replacing the test binary.
pub trait HostProcess {
    fn is_frozen(&self) -> bool;
    fn current_exe(&self) -> std::io::Result<PathBuf>;
    fn clone_executable(&self, exe: &Path, clone_path: &Path) -> std::io::Result<()>;
    fn spawn_detached(&self, exe: &Path, args: &[String]) -> std::io::Result<u32>;

    /// Script mode: restart the host program with its original argument
    /// vector. On success this never returns to the caller.
    fn relaunch(&self, exe: &Path, args: &[String]) -> std::io::Result<()>;

    /// Terminate the current process. On success this never returns.
    fn exit(&self, code: i32);
}

/// Implementation-defined "am I frozen" check (§4.7): a packager sets
/// `PATCHKIT_FROZEN=1` in the environment of a bundled executable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHostProcess;

impl HostProcess for SystemHostProcess {
    fn is_frozen(&self) -> bool {
        std::env::var_os("PATCHKIT_FROZEN").is_some()
    }

    fn current_exe(&self) -> std::io::Result<PathBuf> {
        std::env::current_exe()
    }

    fn clone_executable(&self, exe: &Path, clone_path: &Path) -> std::io::Result<()> {
        std::fs::copy(exe, clone_path)?;

        Ok(())
    }

    fn spawn_detached(&self, exe: &Path, args: &[String]) -> std::io::Result<u32> {
        let child = Command::new(exe).args(args).spawn()?;

        Ok(child.id())
    }

    fn relaunch(&self, exe: &Path, args: &[String]) -> std::io::Result<()> {
        Command::new(exe).args(args).spawn()?;
        std::process::exit(0);
    }

    fn exit(&self, code: i32) {
        std::process::exit(code);
    }
}

/// Returns `true` until the pid has been seen often enough to count as
/// exited, modelling an old executable that takes a few polls to shut down.
/// Test double for [`HostProcess`]; never actually spawns or exits.
#[derive(Debug, Default)]
pub struct StubHostProcess {
    pub frozen: bool,
    pub relaunched: std::sync::Mutex<Vec<(PathBuf, Vec<String>)>>,
    pub spawned: std::sync::Mutex<Vec<PathBuf>>,
    pub exited: std::sync::Mutex<Option<i32>>
}

impl HostProcess for StubHostProcess {
    fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn current_exe(&self) -> std::io::Result<PathBuf> {
        Ok(PathBuf::from("/fake/current-exe"))
    }

    fn clone_executable(&self, exe: &Path, clone_path: &Path) -> std::io::Result<()> {
        std::fs::copy(exe, clone_path)?;

        Ok(())
    }

    fn spawn_detached(&self, exe: &Path, _args: &[String]) -> std::io::Result<u32> {
        self.spawned.lock().unwrap().push(exe.to_path_buf());

        Ok(424242)
    }

    fn relaunch(&self, exe: &Path, args: &[String]) -> std::io::Result<()> {
        self.relaunched.lock().unwrap().push((exe.to_path_buf(), args.to_vec()));

        Ok(())
    }

    fn exit(&self, code: i32) {
        *self.exited.lock().unwrap() = Some(code);
    }
}

/// Liveness check used by frozen-mode's `waitForExit`.
pub trait ProcessWatcher {
    fn is_running(&self, pid: u32) -> bool;
}

/// Real process table lookup, replacing the teacher's dropped `sysinfo`
/// dependency only for this one purpose — polling whether the old
/// executable has exited yet, which has no portable std-only answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessWatcher;

impl ProcessWatcher for SystemProcessWatcher {
    fn is_running(&self, pid: u32) -> bool {
        let mut system = sysinfo::System::new();

        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]), true);

        system.process(sysinfo::Pid::from_u32(pid)).is_some()
    }
}

/// Reports a configured pid as running for a fixed number of polls, then
/// exited — lets tests exercise `wait_for_exit` without a real process.
pub struct StubProcessWatcher {
    pub running_pid: Option<u32>,
    pub polls_until_exit: std::sync::atomic::AtomicU32
}

impl ProcessWatcher for StubProcessWatcher {
    fn is_running(&self, pid: u32) -> bool {
        if self.running_pid != Some(pid) {
            return false;
        }

        use std::sync::atomic::Ordering;

        let remaining = self.polls_until_exit.load(Ordering::SeqCst);

        if remaining == 0 {
            false
        } else {
            self.polls_until_exit.store(remaining - 1, Ordering::SeqCst);
            true
        }
    }
}

/// Polls `watcher` for `pid`'s liveness until it exits or `timeout`
/// elapses. On timeout, escalates to [`BrokenError`] rather than hanging
/// forever — a bound the Python original's stub `waitForExit` lacked.
fn wait_for_exit(watcher: &impl ProcessWatcher, pid: u32) -> Result<(), BrokenError> {
    let deadline = Instant::now() + WAIT_FOR_EXIT_TIMEOUT;

    while watcher.is_running(pid) {
        if Instant::now() >= deadline {
            return Err(BrokenError::new(format!(
                "process {pid} did not exit within {WAIT_FOR_EXIT_TIMEOUT:?} of waitForExit"
            )));
        }

        std::thread::sleep(WAIT_FOR_EXIT_POLL_INTERVAL);
    }

    Ok(())
}

/// Two-phase state machine described by §4.7, driven entirely by the config
/// file at `config_path`. Generic over the diff/patch tools (so the merge
/// step can use either the real `bsdiff`/`diff-match-patch-rs` bindings or
/// their stubs) and over [`HostProcess`]/[`ProcessWatcher`] (so the
/// frozen-mode clone/relaunch/wait machinery can be exercised without
/// spawning real processes in tests).
pub struct UpdateOrchestrator<B, T, H, W> {
    config_path: PathBuf,
    merge_engine: MergeEngine<B, T>,
    host: H,
    watcher: W
}

impl<B, T, H, W> UpdateOrchestrator<B, T, H, W>
where
    B: BinaryDiffTool + Clone + Send + 'static,
    T: TextPatchTool + Clone + Send + 'static,
    H: HostProcess,
    W: ProcessWatcher
{
    pub fn new(config_path: impl Into<PathBuf>, merge_engine: MergeEngine<B, T>, host: H, watcher: W) -> Self {
        Self { config_path: config_path.into(), merge_engine, host, watcher }
    }

    fn read_config(&self) -> Result<Config, OperationalError> {
        Config::read(&self.config_path)
    }

    /// `job` names work the offline phase must still do.
    pub fn needs_patching(&self) -> Result<bool, OperationalError> {
        let cfg = self.read_config()?;

        Ok(!cfg.broken && cfg.job.is_some())
    }

    /// An online-phase download session is in progress (`curdl` recorded
    /// and the orchestrator isn't broken — a broken run's stale `curdl`
    /// must not be reported as still in flight).
    pub fn has_patches_downloading(&self) -> Result<bool, OperationalError> {
        let cfg = self.read_config()?;

        Ok(!cfg.broken && cfg.curdl.as_ref().is_some_and(|urls| !urls.is_empty()))
    }

    pub fn is_broken(&self) -> Result<bool, OperationalError> {
        Ok(self.read_config()?.broken)
    }

    fn require_not_broken(&self) -> Result<Config, UpdateError> {
        let cfg = self.read_config()?;

        if cfg.broken {
            return Err(UpdateError::Broken(BrokenError::new("orchestrator is broken; refusing to act")));
        }

        Ok(cfg)
    }

    fn mark_broken(&self, reason: impl Into<String>) {
        let reason = reason.into();

        tracing::error!(%reason, "marking orchestrator broken");

        let mut cfg = self.read_config().unwrap_or_default();
        cfg.broken = true;

        if let Err(err) = cfg.write(&self.config_path) {
            tracing::error!(%err, "failed to persist broken=true");
        }
    }

    /// Synchronous half of the online phase: given already-downloaded
    /// archive paths, merges them into `tmp_dir` and records
    /// `{job: runpatch, srcdir, patchdir}`.
    #[tracing::instrument(level = "info", skip(self, patches))]
    pub fn pre_patch_program(&self, src_dir: &Path, tmp_dir: &Path, patches: &[PathBuf]) -> Result<(), UpdateError> {
        self.require_not_broken()?;

        std::fs::create_dir_all(tmp_dir).map_err(OperationalError::from)?;

        match self.merge_engine.merge(src_dir, tmp_dir, patches) {
            Ok(_overlay) => {
                let cfg = Config {
                    job: Some(Job::RunPatch),
                    srcdir: Some(src_dir.to_path_buf()),
                    patchdir: Some(tmp_dir.to_path_buf()),
                    oldbin: None,
                    curdl: None,
                    broken: false
                };

                cfg.write(&self.config_path).map_err(UpdateError::Operational)?;

                Ok(())
            },
            Err(err) => {
                self.mark_broken(format!("merge failed during pre_patch_program: {err}"));

                Err(UpdateError::Patch { path: tmp_dir.to_path_buf(), source: err })
            }
        }
    }

    /// Starts the online phase in the background: records every patch URL
    /// in the durable [`DownloadStore`] (§4.1's "on process start the store
    /// first reaps stale locks, then returns all unlocked records as
    /// pending work"), dispatches the pending records onto a
    /// [`ResumableDownloader`], and returns once they're all queued. The
    /// merge + config write happen later, on the downloader's completion
    /// callback, which also releases or forgets each record depending on
    /// whether its archive actually landed on disk.
    #[tracing::instrument(level = "info", skip(self, get_patch_urls))]
    pub fn download_and_pre_patch(
        &self,
        src_dir: &Path,
        tmp_dir: &Path,
        patch_dest: &Path,
        get_patch_urls: impl FnOnce() -> Result<Vec<String>, OperationalError>,
        dl_limit: DownloadLimit
    ) -> Result<(), UpdateError> {
        let mut cfg = self.require_not_broken()?;

        std::fs::create_dir_all(tmp_dir).map_err(OperationalError::from)?;
        std::fs::create_dir_all(patch_dest).map_err(OperationalError::from)?;

        let urls = match cfg.curdl.clone() {
            Some(urls) => urls,
            None => {
                let urls = get_patch_urls()?;

                cfg.curdl = Some(urls.clone());
                cfg.write(&self.config_path).map_err(UpdateError::Operational)?;

                urls
            }
        };

        let archive_paths: Vec<PathBuf> = urls.iter()
            .map(|url| patch_dest.join(format!("{}.{PATCH_EXT}", md5_bytes(url.as_bytes()))))
            .collect();

        let store = DownloadStore::open(patch_dest.join(DOWNLOAD_STORE_DIR)).map_err(UpdateError::Operational)?;

        let reaped = store.reap_stale().map_err(UpdateError::Operational)?;

        if reaped > 0 {
            tracing::info!(reaped, "reaped stale download locks before starting a new session");
        }

        for (url, archive_path) in urls.iter().zip(&archive_paths) {
            let tmp_path = PathBuf::from(format!("{}.{PARTIAL_EXT}", archive_path.display()));

            store.enqueue(url, &tmp_path.to_string_lossy(), &archive_path.to_string_lossy())
                .map_err(UpdateError::Operational)?;
        }

        let config_path = self.config_path.clone();
        let src_dir = src_dir.to_path_buf();
        let tmp_dir = tmp_dir.to_path_buf();
        let merge_engine = self.merge_engine.clone();
        let expected = archive_paths.clone();
        let complete_store = store.clone();

        let downloader = ResumableDownloader::spawn(patch_dest, dl_limit, move |_finished| {
            handle_download_complete(&config_path, &src_dir, &tmp_dir, &expected, &merge_engine, &complete_store);
        })?;

        for record in store.all_pending().map_err(UpdateError::Operational)? {
            store.acquire(&record.dst_path).map_err(UpdateError::Operational)?;

            downloader.enqueue(DownloadItem {
                src_url: record.src_url,
                tmp_path: PathBuf::from(record.tmp_path),
                dst_path: PathBuf::from(record.dst_path)
            }).map_err(UpdateError::Operational)?;
        }

        downloader.close();

        Ok(())
    }

    /// Offline phase (§4.7). Reads the config and, if `job` demands it,
    /// either applies directly (script mode) or hands off to a cloned
    /// executable (frozen mode). Every error caught here is recorded as
    /// `broken` per the crate-wide rule that patching must never prevent
    /// the host program from starting.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn patch_program(&self) -> Result<(), BrokenError> {
        let cfg = match self.read_config() {
            Ok(cfg) => cfg,
            Err(err) => return Err(self.crash(format!("failed to read config: {err}")))
        };

        if cfg.broken {
            return Err(BrokenError::new("orchestrator is broken; refusing to patch"));
        }

        match cfg.job {
            None => Ok(()),
            Some(Job::RunPatch) => self.run_script_mode(&cfg).map_err(|err| self.crash(err.to_string())),
            Some(Job::ApplyBinPatch) => self.run_apply_bin_patch(&cfg).map_err(|err| self.crash(err.to_string()))
        }
    }

    fn run_script_mode(&self, cfg: &Config) -> Result<(), UpdateError> {
        let src_dir = cfg.srcdir.as_deref().ok_or_else(|| UpdateError::Broken(
            BrokenError::new("runpatch job missing srcdir")
        ))?;

        let patch_dir = cfg.patchdir.as_deref().ok_or_else(|| UpdateError::Broken(
            BrokenError::new("runpatch job missing patchdir")
        ))?;

        if self.host.is_frozen() {
            return self.enter_frozen_mode(src_dir, patch_dir);
        }

        self.apply_overlay(src_dir, patch_dir)?;

        Config::delete(&self.config_path).map_err(UpdateError::Operational)?;

        let exe = self.host.current_exe().map_err(OperationalError::from)?;
        let args: Vec<String> = std::env::args().skip(1).collect();

        self.host.relaunch(&exe, &args).map_err(OperationalError::from)?;

        Ok(())
    }

    fn enter_frozen_mode(&self, src_dir: &Path, patch_dir: &Path) -> Result<(), UpdateError> {
        let exe = self.host.current_exe().map_err(OperationalError::from)?;
        let clone_path = PathBuf::from(format!("{}{PATCHER_CLONE_SUFFIX}", exe.display()));

        self.host.clone_executable(&exe, &clone_path).map_err(OperationalError::from)?;

        let cfg = Config {
            job: Some(Job::ApplyBinPatch),
            srcdir: Some(src_dir.to_path_buf()),
            patchdir: Some(patch_dir.to_path_buf()),
            oldbin: Some(exe.clone()),
            curdl: None,
            broken: false
        };

        cfg.write(&self.config_path).map_err(UpdateError::Operational)?;

        self.host.spawn_detached(&clone_path, &[]).map_err(OperationalError::from)?;

        self.host.exit(0);

        Ok(())
    }

    fn run_apply_bin_patch(&self, cfg: &Config) -> Result<(), UpdateError> {
        let src_dir = cfg.srcdir.as_deref().ok_or_else(|| UpdateError::Broken(
            BrokenError::new("applybinpatch job missing srcdir")
        ))?;

        let patch_dir = cfg.patchdir.as_deref().ok_or_else(|| UpdateError::Broken(
            BrokenError::new("applybinpatch job missing patchdir")
        ))?;

        let oldbin = cfg.oldbin.as_deref().ok_or_else(|| UpdateError::Broken(
            BrokenError::new("applybinpatch job missing oldbin")
        ))?;

        if let Some(pid) = current_pid_of(oldbin) {
            wait_for_exit(&self.watcher, pid)?;
        }

        self.apply_overlay(src_dir, patch_dir)?;

        if let Err(delete_err) = Config::delete(&self.config_path) {
            tracing::error!(%delete_err, "failed to delete config after apply, falling back to an empty document");

            if let Err(fallback_err) = std::fs::write(&self.config_path, b"[]") {
                return Err(UpdateError::Broken(BrokenError::new(format!(
                    "config at {} is neither deletable nor overwritable after a successful apply: {fallback_err}",
                    self.config_path.display()
                ))));
            }
        }

        self.host.relaunch(oldbin, &[]).map_err(OperationalError::from)?;

        Ok(())
    }

    fn apply_overlay(&self, src_dir: &Path, patch_dir: &Path) -> Result<(), UpdateError> {
        use crate::apply::ApplyEngine;
        use crate::merge::StagedOverlay;

        let overlay = StagedOverlay {
            root: patch_dir.to_path_buf(),
            deleted: read_overlay_deletions(patch_dir).map_err(UpdateError::Operational)?
        };

        ApplyEngine::apply(src_dir, &overlay)?;

        let _ = std::fs::remove_dir_all(patch_dir);

        Ok(())
    }

    fn crash(&self, message: String) -> BrokenError {
        tracing::error!(%message, "patch_program failing into broken state");

        self.mark_broken(message.clone());

        let log_path = self.config_path.with_file_name(CRASH_LOG_NAME);
        let _ = append_crash_log(&log_path, &message);

        BrokenError::new(message)
    }
}

fn read_overlay_deletions(patch_dir: &Path) -> Result<Vec<String>, OperationalError> {
    let cfg_path = patch_dir.join(crate::consts::CFG_NAME);

    if !cfg_path.is_file() {
        return Ok(Vec::new());
    }

    let manifest = crate::manifest::Manifest::from_json(&std::fs::read(cfg_path)?)?;

    Ok(manifest.deleted)
}

fn handle_download_complete<B, T>(
    config_path: &Path,
    src_dir: &Path,
    tmp_dir: &Path,
    expected: &[PathBuf],
    merge_engine: &MergeEngine<B, T>,
    store: &DownloadStore
)
where
    B: BinaryDiffTool,
    T: TextPatchTool
{
    let mut all_present = true;

    for path in expected {
        let dst = path.to_string_lossy();

        if path.is_file() {
            if let Err(err) = store.forget(&dst) {
                tracing::warn!(%err, "failed to forget a completed download record");
            }
        } else {
            all_present = false;

            if let Err(err) = store.release(&dst) {
                tracing::warn!(%err, "failed to release a download record for retry");
            }
        }
    }

    if !all_present {
        tracing::warn!("not every expected patch archive is present yet; a peer may still be downloading");
        return;
    }

    match merge_engine.merge(src_dir, tmp_dir, expected) {
        Ok(_overlay) => {
            let cfg = Config {
                job: Some(Job::RunPatch),
                srcdir: Some(src_dir.to_path_buf()),
                patchdir: Some(tmp_dir.to_path_buf()),
                oldbin: None,
                curdl: None,
                broken: false
            };

            if let Err(err) = cfg.write(config_path) {
                tracing::error!(%err, "failed to persist post-merge config");
            }
        },
        Err(err) => {
            tracing::error!(%err, "merge failed while completing the online phase");

            let mut cfg = Config::read(config_path).unwrap_or_default();
            cfg.broken = true;

            if let Err(write_err) = cfg.write(config_path) {
                tracing::error!(%write_err, "failed to persist broken=true after a failed merge");
            }
        }
    }
}

/// Best-effort recovery of a pid to wait on for `oldbin`. Real process
/// identification of "the specific process that launched the clone" is
/// outside what a portable implementation can do without OS-specific APIs;
/// callers that need it pass the frozen-mode parent's pid through
/// out-of-band (e.g. a `--oldbin-pid` argument) rather than this helper
/// always finding one. Returning `None` skips the wait, matching `job`
/// idempotency: a second run of `run_apply_bin_patch` after `oldbin` has
/// already exited must still make progress.
fn current_pid_of(_oldbin: &Path) -> Option<u32> {
    std::env::var("PATCHKIT_OLDBIN_PID").ok().and_then(|v| v.parse().ok())
}

fn append_crash_log(path: &Path, message: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;

    writeln!(file, "{message}")
}
