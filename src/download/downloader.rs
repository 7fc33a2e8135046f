use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::consts::{DOWNLOAD_BLOCK_SIZE, DOWNLOAD_QUEUE_CAPACITY, LOCK_FILE_NAME, STALE_LOCK_AGE};
use crate::error::{LockError, OperationalError, UpdateError};

/// One `{src, tmp, dst}` triple queued for download.
#[derive(Debug, Clone)]
pub struct DownloadItem {
    pub src_url: String,
    pub tmp_path: PathBuf,
    pub dst_path: PathBuf
}

/// Non-zero bandwidth cap in kilobytes per second. `None` means unlimited.
pub type DownloadLimit = Option<u32>;

/// Releases the staging directory's sentinel lock file on drop — the
/// "orderly shutdown" release named by the spec. A crash leaves the file
/// behind; [`acquire_lock`] reclaims it once it's older than
/// [`STALE_LOCK_AGE`].
struct LockGuard {
    path: PathBuf
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn acquire_lock(staging_dir: &Path) -> Result<LockGuard, UpdateError> {
    fs::create_dir_all(staging_dir).map_err(OperationalError::from)?;

    let lock_path = staging_dir.join(LOCK_FILE_NAME);

    if let Ok(contents) = fs::read_to_string(&lock_path) {
        let held_since = contents.trim().parse::<u64>().ok()
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

        let stale = held_since
            .map(|since| SystemTime::now().duration_since(since).unwrap_or_default() >= STALE_LOCK_AGE)
            .unwrap_or(false);

        if !stale {
            return Err(LockError { path: staging_dir.to_path_buf(), held_since }.into());
        }

        tracing::warn!(path = %lock_path.display(), "reclaiming stale staging directory lock");
    }

    let now = SystemTime::now().duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs();

    fs::write(&lock_path, now.to_string()).map_err(OperationalError::from)?;

    Ok(LockGuard { path: lock_path })
}

/// Pure bandwidth-limiter arithmetic, unit-tested directly per the spec's
/// corrected formula: `minDlTime = block_bytes / (limit_kbps * 1000)`; sleep
/// the shortfall only when the block was read faster than that, never when
/// it was already slower.
fn sleep_duration(block_bytes: usize, limit_kbps: u32, elapsed: Duration) -> Duration {
    if limit_kbps == 0 {
        return Duration::ZERO;
    }

    let min_dl_time = Duration::from_secs_f64(block_bytes as f64 / (limit_kbps as f64 * 1000.0));

    min_dl_time.saturating_sub(elapsed)
}

/// Whether the server's advertised content length matches a resumed file's
/// current size, meaning the download already completed in a prior run.
fn is_already_complete(content_length: u64, current_size: u64) -> bool {
    content_length == current_size
}

/// Pure decision behind §4.2's "treats HTTP 206 as success": given the
/// status code a server actually returned and whether a `Range` request was
/// sent, decides whether the response continues a partial download
/// (`Ok(true)`), must be treated as a fresh, non-appended download because
/// the server ignored the range request (`Ok(false)`), or is an HTTP-level
/// failure that must not be silently appended to `tmp`.
fn resume_decision(status_code: i32, had_partial: bool) -> Result<bool, OperationalError> {
    if !(200..400).contains(&status_code) {
        return Err(OperationalError::Other(format!("server returned HTTP {status_code}")));
    }

    Ok(had_partial && status_code == 206)
}

/// A background worker thread consuming a bounded FIFO of [`DownloadItem`]s,
/// modelled on the teacher's `network/downloader/basic.rs` blocking,
/// `minreq`-based fetch loop, generalized to range-resume and a
/// caller-supplied bandwidth cap.
pub struct ResumableDownloader {
    sender: flume::Sender<DownloadItem>,
    handle: Option<JoinHandle<()>>
}

impl ResumableDownloader {
    /// Acquires the staging directory's lock (failing fast with
    /// [`LockError`] if another instance already holds it) and spawns the
    /// daemon worker thread. The lock moves into the worker's own closure so
    /// it is held for exactly as long as the thread runs, independent of
    /// whether the caller ever joins the returned handle — that's what lets
    /// [`ResumableDownloader::close`] return without waiting for the queue
    /// to drain while still releasing the lock only on orderly worker exit.
    /// `on_complete` runs on the worker thread exactly once, after the
    /// sender side of the queue is dropped and every queued item has been
    /// attempted.
    pub fn spawn(
        staging_dir: impl AsRef<Path>,
        limit: DownloadLimit,
        on_complete: impl FnOnce(Vec<PathBuf>) + Send + 'static
    ) -> Result<Self, UpdateError> {
        let lock = acquire_lock(staging_dir.as_ref())?;

        let (sender, receiver) = flume::bounded(DOWNLOAD_QUEUE_CAPACITY);
        let limit_kbps = limit.unwrap_or(0);

        let handle = std::thread::Builder::new()
            .name("resumable-downloader".to_string())
            .spawn(move || {
                let _lock = lock;
                let mut finished = Vec::new();

                for item in receiver.iter() {
                    match download_item(&item, limit_kbps) {
                        Ok(()) => finished.push(item.dst_path),
                        Err(err) => tracing::warn!(
                            src = %item.src_url, %err,
                            "download aborted, tmp file retained for resume"
                        )
                    }
                }

                on_complete(finished);
            })
            .expect("failed to spawn resumable-downloader thread");

        Ok(Self { sender, handle: Some(handle) })
    }

    /// Queue one more item for the worker. Blocks if the bounded FIFO is
    /// full.
    pub fn enqueue(&self, item: DownloadItem) -> Result<(), OperationalError> {
        self.sender.send(item)
            .map_err(|err| OperationalError::Other(format!("downloader worker is gone: {err}")))
    }

    /// Signal that no more items are coming and return without waiting for
    /// the queue to drain. The worker thread keeps running — and keeps the
    /// staging directory locked — until it finishes, just not joined by the
    /// caller. Matches the spec's "daemon: terminates with the host
    /// program" and "`download_and_pre_patch` ... returns once downloads
    /// are enqueued".
    pub fn close(self) {
        drop(self.sender);
    }

    /// Drop the sender (signalling the worker to drain and exit) and block
    /// until the thread has finished. Used by tests and by callers that
    /// need the completion callback to have already run before proceeding.
    pub fn join(self) {
        let Self { sender, handle } = self;

        drop(sender);

        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[tracing::instrument(level = "debug", skip(item))]
fn download_item(item: &DownloadItem, limit_kbps: u32) -> Result<(), OperationalError> {
    let mut tmp_size = fs::metadata(&item.tmp_path).map(|m| m.len()).unwrap_or(0);

    let mut request = minreq::get(&item.src_url);

    if tmp_size > 0 {
        request = request.with_header("Range", format!("bytes={tmp_size}-"));
    }

    let mut response = request.send_lazy()?;

    let resuming = resume_decision(response.status_code, tmp_size > 0)?;

    if tmp_size > 0 && !resuming {
        tracing::warn!(
            status = response.status_code,
            "server did not honor the range request; restarting download from scratch"
        );

        tmp_size = 0;
    }

    let content_length = response.size_hint().1.map(|total| total as u64);

    if let Some(content_length) = content_length {
        if is_already_complete(content_length, tmp_size) {
            return finalize(item);
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(resuming)
        .truncate(!resuming)
        .open(&item.tmp_path)?;

    let mut block = Vec::with_capacity(DOWNLOAD_BLOCK_SIZE);

    loop {
        block.clear();

        let started = Instant::now();

        for _ in 0..DOWNLOAD_BLOCK_SIZE {
            match response.next() {
                Some(Ok((byte, _))) => block.push(byte),
                Some(Err(err)) => return Err(err.into()),
                None => break
            }
        }

        if block.is_empty() {
            break;
        }

        file.write_all(&block)?;

        if limit_kbps > 0 {
            let wait = sleep_duration(block.len(), limit_kbps, started.elapsed());

            if !wait.is_zero() {
                std::thread::sleep(wait);
            }
        }
    }

    finalize(item)
}

fn finalize(item: &DownloadItem) -> Result<(), OperationalError> {
    fs::rename(&item.tmp_path, &item.dst_path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_on_same_directory_fails_fast() {
        let dir = tempfile::tempdir().unwrap();

        let downloader = ResumableDownloader::spawn(dir.path(), None, |_| {}).expect("first lock succeeds");

        let second = ResumableDownloader::spawn(dir.path(), None, |_| {});

        assert!(matches!(second, Err(UpdateError::Lock(_))));

        downloader.join();
    }

    #[test]
    fn lock_is_released_on_drop_and_reusable() {
        let dir = tempfile::tempdir().unwrap();

        let downloader = ResumableDownloader::spawn(dir.path(), None, |_| {}).unwrap();
        downloader.join();

        // Worker thread has exited and the guard was dropped; a fresh
        // instance against the same directory must succeed.
        let second = ResumableDownloader::spawn(dir.path(), None, |_| {});

        assert!(second.is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();

        let lock_path = dir.path().join(LOCK_FILE_NAME);
        let stale_time = SystemTime::now() - STALE_LOCK_AGE - Duration::from_secs(60);
        let stale_secs = stale_time.duration_since(UNIX_EPOCH).unwrap().as_secs();

        fs::write(&lock_path, stale_secs.to_string()).unwrap();

        let downloader = ResumableDownloader::spawn(dir.path(), None, |_| {});

        assert!(downloader.is_ok());
    }

    #[test]
    fn fresh_lock_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();

        let lock_path = dir.path().join(LOCK_FILE_NAME);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();

        fs::write(&lock_path, now.to_string()).unwrap();

        let downloader = ResumableDownloader::spawn(dir.path(), None, |_| {});

        assert!(matches!(downloader, Err(UpdateError::Lock(_))));
    }

    #[test]
    fn sleep_duration_never_sleeps_when_already_slower_than_limit() {
        // 8 KiB at 8 KiB/s nominally takes 1s; an 1.5s elapsed is already
        // slower than the limit, so no additional sleep is owed.
        let elapsed = Duration::from_millis(1500);

        assert_eq!(sleep_duration(8 * 1024, 8, elapsed), Duration::ZERO);
    }

    #[test]
    fn sleep_duration_waits_out_the_shortfall_when_faster_than_limit() {
        // Same block/limit, but it only took 200ms: owe the remaining 800ms.
        let elapsed = Duration::from_millis(200);

        let slept = sleep_duration(8 * 1024, 8, elapsed);

        assert!((slept.as_secs_f64() - 0.8).abs() < 0.01);
    }

    #[test]
    fn unlimited_bandwidth_never_sleeps() {
        assert_eq!(sleep_duration(8 * 1024, 0, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn already_complete_detection() {
        assert!(is_already_complete(100, 100));
        assert!(!is_already_complete(100, 40));
    }

    #[test]
    fn resume_decision_accepts_206_when_a_partial_exists() {
        assert_eq!(resume_decision(206, true).unwrap(), true);
    }

    #[test]
    fn resume_decision_restarts_when_server_ignores_the_range_request() {
        assert_eq!(resume_decision(200, true).unwrap(), false);
    }

    #[test]
    fn resume_decision_is_false_for_a_fresh_download() {
        assert_eq!(resume_decision(200, false).unwrap(), false);
    }

    #[test]
    fn resume_decision_errors_on_http_error_statuses() {
        assert!(resume_decision(404, false).is_err());
        assert!(resume_decision(500, true).is_err());
    }
}
