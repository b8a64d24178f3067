use proxy_core::{Hash256, MetaRecord, ProxyError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const META_SUFFIX: &str = ".meta.json";

/// Directory of per-key metadata files (§4.2). All operations are
/// best-effort: I/O and parse failures are logged, never propagated as a
/// fatal error to the caller (§7's Metadata I/O failure row).
pub struct MetaStore {
    dir: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanupStats {
    pub records_deleted: usize,
    pub bytes_freed: u64,
}

impl MetaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ProxyError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, key: &Hash256) -> PathBuf {
        self.dir.join(format!("{}{META_SUFFIX}", key.to_hex()))
    }

    /// Atomically replace the MetaRecord file for `key` (write-to-temp,
    /// then rename within the same directory).
    pub fn write(
        &self,
        key: Hash256,
        prefix_text: &str,
        block_hashes: &[Hash256],
        words_per_block: u32,
        model_id: &str,
    ) -> Result<(), ProxyError> {
        let record = MetaRecord {
            key,
            model_id: model_id.to_string(),
            words_per_block,
            prefix_len_chars: prefix_text.chars().count(),
            block_hashes: block_hashes.to_vec(),
            updated_at: proxy_core::time::now_secs(),
        };
        self.write_record(&record)
    }

    fn write_record(&self, record: &MetaRecord) -> Result<(), ProxyError> {
        let path = self.record_path(&record.key);
        let tmp_path = self.dir.join(format!("{}.tmp", record.key.to_hex()));
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Re-read, bump `updated_at`, rewrite. A missing file degrades to a
    /// logged warning, not a returned error (§4.2, §7).
    pub fn touch(&self, key: &Hash256) -> Result<(), ProxyError> {
        let path = self.record_path(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(key = %key, "touch: no metadata record to update");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let mut record: MetaRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "touch: metadata record is corrupt");
                return Ok(());
            }
        };
        record.updated_at = proxy_core::time::now_secs();
        self.write_record(&record)
    }

    /// Enumerate all MetaRecords, sorted by file mtime descending. Entries
    /// that fail to parse are skipped with a warning (§4.2).
    pub fn scan(&self) -> Vec<MetaRecord> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(err) => {
                tracing::warn!(dir = %self.dir.display(), error = %err, "scan: cannot read metadata directory");
                return Vec::new();
            }
        };

        let mut dated: Vec<(std::time::SystemTime, MetaRecord)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(META_SUFFIX) {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            let bytes = match fs::read(&path) {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "scan: cannot read metadata file");
                    continue;
                }
            };
            match serde_json::from_slice::<MetaRecord>(&bytes) {
                Ok(record) => dated.push((mtime, record)),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "scan: skipping corrupt metadata record");
                }
            }
        }
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        dated.into_iter().map(|(_, r)| r).collect()
    }

    /// Delete records (and their snapshot files, best-effort) older than
    /// `max_age`; if the total snapshot size still exceeds
    /// `max_total_bytes`, delete oldest-first until under the cap (§4.2).
    /// `snapshot_dir` is the optional mount where the backend writes its
    /// `.bin` files; a missing snapshot is never an error (§3).
    pub fn cleanup(
        &self,
        max_age: Duration,
        max_total_bytes: u64,
        snapshot_dir: Option<&Path>,
    ) -> CleanupStats {
        let now = proxy_core::time::now_secs();
        let max_age_secs = max_age.as_secs();
        let mut records = self.scan();
        records.sort_by_key(|r| r.updated_at);

        let mut stats = CleanupStats::default();
        let mut kept: Vec<(MetaRecord, u64)> = Vec::new();

        for record in records {
            let age = now.saturating_sub(record.updated_at);
            if age > max_age_secs {
                let freed = self.delete_record(&record, snapshot_dir);
                stats.records_deleted += 1;
                stats.bytes_freed += freed;
            } else {
                let size = snapshot_dir
                    .map(|dir| dir.join(record.snapshot_basename()))
                    .and_then(|p| fs::metadata(p).ok())
                    .map(|m| m.len())
                    .unwrap_or(0);
                kept.push((record, size));
            }
        }

        let mut total: u64 = kept.iter().map(|(_, size)| size).sum();
        kept.sort_by_key(|(r, _)| r.updated_at);
        for (record, size) in kept {
            if total <= max_total_bytes {
                break;
            }
            let freed = self.delete_record(&record, snapshot_dir);
            stats.records_deleted += 1;
            stats.bytes_freed += freed;
            total = total.saturating_sub(size);
        }

        stats
    }

    fn delete_record(&self, record: &MetaRecord, snapshot_dir: Option<&Path>) -> u64 {
        let path = self.record_path(&record.key);
        if let Err(err) = fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "cleanup: failed to remove metadata record");
            }
        }

        let Some(dir) = snapshot_dir else {
            return 0;
        };
        let snapshot_path = dir.join(record.snapshot_basename());
        let size = fs::metadata(&snapshot_path).map(|m| m.len()).unwrap_or(0);
        match fs::remove_file(&snapshot_path) {
            Ok(()) => size,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => {
                tracing::warn!(path = %snapshot_path.display(), error = %err, "cleanup: failed to remove snapshot file");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_core::Hash256;

    fn key(byte: u8) -> Hash256 {
        Hash256([byte; 32])
    }

    #[test]
    fn write_then_scan_finds_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path()).unwrap();
        store.write(key(1), "hello world", &[], 4, "m1").unwrap();
        let records = store.scan();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, key(1));
        assert_eq!(records[0].model_id, "m1");
    }

    #[test]
    fn touch_bumps_updated_at_without_decreasing() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path()).unwrap();
        store.write(key(2), "x", &[], 4, "m1").unwrap();
        let before = store.scan()[0].updated_at;
        store.touch(&key(2)).unwrap();
        let after = store.scan()[0].updated_at;
        assert!(after >= before);
    }

    #[test]
    fn touch_on_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path()).unwrap();
        assert!(store.touch(&key(9)).is_ok());
    }

    #[test]
    fn scan_skips_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path()).unwrap();
        store.write(key(3), "good", &[], 4, "m1").unwrap();
        std::fs::write(dir.path().join("deadbeef.meta.json"), b"not json").unwrap();
        let records = store.scan();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn cleanup_removes_records_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path()).unwrap();
        store.write(key(4), "old", &[], 4, "m1").unwrap();
        let stats = store.cleanup(Duration::from_secs(0), u64::MAX, None);
        assert_eq!(stats.records_deleted, 1);
        assert!(store.scan().is_empty());
    }

    #[test]
    fn cleanup_tolerates_missing_snapshot_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::new(dir.path()).unwrap();
        store.write(key(5), "x", &[], 4, "m1").unwrap();
        let stats = store.cleanup(Duration::from_secs(3600), u64::MAX, Some(Path::new("/nonexistent")));
        assert_eq!(stats.records_deleted, 0);
    }
}
