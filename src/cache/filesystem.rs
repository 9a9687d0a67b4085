//! File System Cache - Local Disk Mirror
//!
//! Medium-latency tier holding one file per object under a base directory.
//!
//! # Design
//!
//! - Layout: `<base_dir>/<uuid>.<ext>`, nothing else
//! - Writes go to a hidden temp file and are renamed into place
//! - Stores, deletes, evictions and sweeps serialise on one async mutex;
//!   reads take no lock
//! - Freshness is the file mtime; eviction order is last-read recency kept in
//!   memory, falling back to mtime for files untouched since startup

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::layer::{ByteStream, CacheLayer, LayerCounters, LayerKind, LayerStats};
use crate::config::FileSystemConfig;
use crate::error::{Error, Result};

const TEMP_SUFFIX: &str = "tmp";

#[derive(Debug, Clone, Copy)]
struct ResidentFile {
    id: Uuid,
    len: u64,
    modified: SystemTime,
}

/// File system cache - bounded on-disk mirror
pub struct FileSystemCache {
    config: FileSystemConfig,
    current_size: AtomicU64,
    /// Last read per object since startup
    recency: DashMap<Uuid, SystemTime>,
    write_lock: Mutex<()>,
    counters: LayerCounters,
}

impl FileSystemCache {
    /// Open (creating if needed) the cache directory and seed the resident size
    pub async fn open(config: FileSystemConfig) -> Result<Self> {
        fs::create_dir_all(&config.base_dir).await?;

        let cache = Self {
            config,
            current_size: AtomicU64::new(0),
            recency: DashMap::new(),
            write_lock: Mutex::new(()),
            counters: LayerCounters::new(),
        };

        cache.remove_stale_temp_files().await?;
        let files = cache.resident_files().await?;
        let size: u64 = files.iter().map(|f| f.len).sum();
        cache.current_size.store(size, Ordering::Relaxed);

        info!(
            "File cache: opened {} ({} objects, {} bytes)",
            cache.config.base_dir.display(),
            files.len(),
            size
        );
        Ok(cache)
    }

    /// Current resident bytes
    pub fn size(&self) -> u64 {
        self.current_size.load(Ordering::Relaxed)
    }

    /// Configured maximum size
    pub fn capacity(&self) -> u64 {
        self.config.max_size_bytes
    }

    pub fn base_dir(&self) -> &Path {
        &self.config.base_dir
    }

    /// Path of the file backing `id`
    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.config
            .base_dir
            .join(format!("{}.{}", id, self.config.extension))
    }

    fn temp_path_for(&self, id: Uuid) -> PathBuf {
        self.config
            .base_dir
            .join(format!(".{}.{}.{}", id, Uuid::new_v4().simple(), TEMP_SUFFIX))
    }

    fn parse_id(&self, path: &Path) -> Option<Uuid> {
        if path.extension()?.to_str()? != self.config.extension {
            return None;
        }
        Uuid::parse_str(path.file_stem()?.to_str()?).ok()
    }

    fn is_expired(&self, modified: SystemTime) -> bool {
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default()
            > self.config.ttl()
    }

    async fn resident_files(&self) -> Result<Vec<ResidentFile>> {
        let mut dir = fs::read_dir(&self.config.base_dir).await?;
        let mut files = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(id) = self.parse_id(&path) else {
                continue;
            };
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                // Raced with a delete, or not a regular file
                _ => continue,
            };
            files.push(ResidentFile {
                id,
                len: meta.len(),
                modified: meta.modified()?,
            });
        }

        Ok(files)
    }

    async fn remove_stale_temp_files(&self) -> Result<()> {
        let mut dir = fs::read_dir(&self.config.base_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
                debug!("File cache: removing stale temp file {}", name);
                let _ = fs::remove_file(entry.path()).await;
            }
        }
        Ok(())
    }

    /// Remove the backing file, returning the bytes freed. Caller holds `write_lock`.
    async fn remove_locked(&self, id: Uuid) -> Result<u64> {
        let path = self.path_for(id);
        let len = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        }

        self.current_size.fetch_sub(len, Ordering::Relaxed);
        self.recency.remove(&id);
        Ok(len)
    }

    /// Evict the least recently read file. Caller holds `write_lock`.
    async fn evict_oldest_locked(&self) -> Result<bool> {
        let files = self.resident_files().await?;

        let victim = files
            .iter()
            .map(|f| {
                let last_used = self
                    .recency
                    .get(&f.id)
                    .map(|t| *t)
                    .unwrap_or(f.modified);
                (last_used, f.id)
            })
            .min();

        let Some((_, id)) = victim else {
            return Ok(false);
        };

        let freed = self.remove_locked(id).await?;
        self.counters.record_evictions(1);
        debug!("File cache: evicted {} ({} bytes)", id, freed);
        Ok(true)
    }

    /// Delete every file older than the TTL, returning how many were removed
    pub async fn sweep_expired(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let files = self.resident_files().await?;

        let mut removed = 0;
        for file in files.iter().filter(|f| self.is_expired(f.modified)) {
            match self.remove_locked(file.id).await {
                Ok(0) => {}
                Ok(_) => removed += 1,
                Err(e) => error!("File cache: failed to remove expired {}: {}", file.id, e),
            }
        }

        if removed > 0 {
            info!("File cache: cleaned up {} expired files", removed);
        }
        Ok(removed)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `sweep_interval` until cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = cache.sweep_expired().await {
                            error!("File cache: sweep failed: {}", e);
                        }
                    }
                }
            }
            debug!("File cache sweeper stopped");
        })
    }

    /// Open the object if present and fresh; expired files are removed
    async fn open_fresh(&self, id: Uuid) -> Result<Option<(fs::File, u64)>> {
        let path = self.path_for(id);
        loop {
            let file = match fs::File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let meta = file.metadata().await?;
            if !self.is_expired(meta.modified()?) {
                return Ok(Some((file, meta.len())));
            }

            drop(file);
            if self.remove_if_expired(id).await? {
                debug!("File cache: dropped expired object {}", id);
                return Ok(None);
            }
            // Replaced by a concurrent store; open the new copy
        }
    }

    /// Remove the file if it is still expired once `write_lock` is held.
    ///
    /// Returns false when a fresh copy was stored in the meantime.
    async fn remove_if_expired(&self, id: Uuid) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let modified = match fs::metadata(self.path_for(id)).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        if !self.is_expired(modified) {
            return Ok(false);
        }
        self.remove_locked(id).await?;
        Ok(true)
    }

    /// Record a read for eviction order, and extend the TTL when configured
    async fn touch(&self, id: Uuid) {
        let now = SystemTime::now();
        self.recency.insert(id, now);

        if !self.config.read_extends_ttl {
            return;
        }

        let path = self.path_for(id);
        let touched = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .and_then(|f| f.set_modified(now))
        })
        .await;

        match touched {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("File cache: could not touch {}: {}", id, e),
            Err(e) => debug!("File cache: touch task failed for {}: {}", id, e),
        }
    }

    async fn lookup(&self, id: Uuid) -> Result<(fs::File, u64)> {
        match self.open_fresh(id).await {
            Ok(Some(found)) => Ok(found),
            Ok(None) => {
                self.counters.record_miss();
                Err(Error::not_found(LayerKind::FileSystem, id))
            }
            Err(e) => {
                self.counters.record_miss();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl CacheLayer for FileSystemCache {
    fn kind(&self) -> LayerKind {
        LayerKind::FileSystem
    }

    async fn store(&self, id: Uuid, data: Bytes) -> Result<()> {
        let size = data.len() as u64;
        if size > self.config.max_size_bytes {
            return Err(Error::CapacityExhausted {
                layer: LayerKind::FileSystem,
                needed: size,
                capacity: self.config.max_size_bytes,
            });
        }

        let _guard = self.write_lock.lock().await;

        // Replacement is delete + store
        self.remove_locked(id).await?;

        while self.size() + size > self.config.max_size_bytes {
            if !self.evict_oldest_locked().await? {
                return Err(Error::CapacityExhausted {
                    layer: LayerKind::FileSystem,
                    needed: size,
                    capacity: self.config.max_size_bytes,
                });
            }
        }

        let path = self.path_for(id);
        let temp = self.temp_path_for(id);
        if let Err(e) = fs::write(&temp, &data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        self.current_size.fetch_add(size, Ordering::Relaxed);
        self.recency.insert(id, SystemTime::now());

        info!(
            "File cache: stored object {} ({} bytes) at {}",
            id,
            size,
            path.display()
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Bytes> {
        let start = Instant::now();
        let (mut file, len) = self.lookup(id).await?;

        let mut buf = Vec::with_capacity(len as usize);
        if let Err(e) = file.read_to_end(&mut buf).await {
            self.counters.record_miss();
            return Err(e.into());
        }

        self.touch(id).await;
        self.counters.record_hit(start.elapsed());
        Ok(Bytes::from(buf))
    }

    async fn get_stream(&self, id: Uuid) -> Result<(ByteStream, u64)> {
        let start = Instant::now();
        let (file, len) = self.lookup(id).await?;

        self.touch(id).await;
        self.counters.record_hit(start.elapsed());
        Ok((Box::pin(file), len))
    }

    async fn exists(&self, id: Uuid) -> Result<bool> {
        match fs::metadata(self.path_for(id)).await {
            Ok(meta) => Ok(meta.is_file() && !self.is_expired(meta.modified()?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let freed = self.remove_locked(id).await?;
        if freed > 0 {
            info!("File cache: deleted object {} ({} bytes)", id, freed);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        match fs::remove_dir_all(&self.config.base_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.config.base_dir).await?;

        self.current_size.store(0, Ordering::Relaxed);
        self.recency.clear();
        self.counters.reset();
        info!("File cache: cleared all objects");
        Ok(())
    }

    async fn stats(&self) -> Result<LayerStats> {
        let objects = self.resident_files().await?.len() as u64;
        Ok(self
            .counters
            .snapshot(LayerKind::FileSystem, objects, self.size(), self.capacity()))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_size: u64) -> FileSystemConfig {
        FileSystemConfig {
            base_dir: dir.path().join("cache"),
            max_size_bytes: max_size,
            ..Default::default()
        }
    }

    fn blob(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    fn set_mtime(path: &Path, when: SystemTime) {
        std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[tokio::test]
    async fn test_filesystem_cache_store_get() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024 * 1024)).await.unwrap();
        let id = Uuid::new_v4();

        cache.store(id, Bytes::from_static(b"mesh bytes")).await.unwrap();
        assert!(cache.path_for(id).exists());
        assert!(cache.path_for(id).to_string_lossy().ends_with(".glb"));
        assert_eq!(cache.size(), 10);

        assert_eq!(cache.get(id).await.unwrap().as_ref(), b"mesh bytes");
        assert!(cache.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_cache_stream() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024 * 1024)).await.unwrap();
        let id = Uuid::new_v4();
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();

        cache.store(id, Bytes::from(payload.clone())).await.unwrap();

        let (mut reader, len) = cache.get_stream(id).await.unwrap();
        assert_eq!(len, payload.len() as u64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_filesystem_cache_miss() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();

        let result = cache.get(Uuid::new_v4()).await;
        assert_matches!(result, Err(Error::NotFound { layer: Some(LayerKind::FileSystem), .. }));
        assert!(cache.get_stream(Uuid::new_v4()).await.map(|_| ()).unwrap_err().is_not_found());

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_filesystem_cache_evicts_least_recently_read() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 300)).await.unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let d = Uuid::new_v4();

        for (id, fill) in [(a, 1), (b, 2), (c, 3)] {
            cache.store(id, blob(100, fill)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cache.get(a).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.store(d, blob(100, 4)).await.unwrap();

        assert!(cache.exists(a).await.unwrap());
        assert!(!cache.exists(b).await.unwrap());
        assert!(cache.exists(c).await.unwrap());
        assert!(cache.exists(d).await.unwrap());
        assert!(cache.size() <= 300);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.objects, 3);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_filesystem_cache_object_larger_than_capacity() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 100)).await.unwrap();
        let keep = Uuid::new_v4();
        cache.store(keep, blob(50, 1)).await.unwrap();

        let result = cache.store(Uuid::new_v4(), blob(101, 2)).await;
        assert_matches!(
            result,
            Err(Error::CapacityExhausted { layer: LayerKind::FileSystem, needed: 101, capacity: 100 })
        );
        // Nothing was evicted for a store that could never fit
        assert!(cache.exists(keep).await.unwrap());
    }

    #[tokio::test]
    async fn test_filesystem_cache_replace_keeps_accounting() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        let id = Uuid::new_v4();

        cache.store(id, blob(100, 1)).await.unwrap();
        cache.store(id, blob(40, 2)).await.unwrap();

        assert_eq!(cache.size(), 40);
        assert_eq!(cache.get(id).await.unwrap(), blob(40, 2));
    }

    #[tokio::test]
    async fn test_filesystem_cache_reopen_seeds_size() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        {
            let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
            cache.store(id, blob(123, 7)).await.unwrap();
        }

        // Leftover temp file from an interrupted write is discarded
        let stale = dir.path().join("cache").join(format!(".{}.abc.tmp", id));
        std::fs::write(&stale, b"partial").unwrap();

        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        assert_eq!(cache.size(), 123);
        assert!(!stale.exists());
        assert_eq!(cache.get(id).await.unwrap(), blob(123, 7));
    }

    #[tokio::test]
    async fn test_filesystem_cache_sweep_expired() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();

        cache.store(old, blob(10, 1)).await.unwrap();
        cache.store(fresh, blob(20, 2)).await.unwrap();
        set_mtime(&cache.path_for(old), SystemTime::now() - Duration::from_secs(7200));

        assert_eq!(cache.sweep_expired().await.unwrap(), 1);
        assert!(!cache.path_for(old).exists());
        assert!(cache.exists(fresh).await.unwrap());
        assert_eq!(cache.size(), 20);
    }

    #[tokio::test]
    async fn test_filesystem_cache_expired_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        let id = Uuid::new_v4();

        cache.store(id, blob(10, 1)).await.unwrap();
        set_mtime(&cache.path_for(id), SystemTime::now() - Duration::from_secs(7200));

        assert!(!cache.exists(id).await.unwrap());
        assert!(cache.get(id).await.unwrap_err().is_not_found());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_filesystem_cache_expiry_spares_replaced_file() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        let id = Uuid::new_v4();

        cache.store(id, blob(10, 1)).await.unwrap();
        set_mtime(&cache.path_for(id), SystemTime::now() - Duration::from_secs(7200));

        // A reader saw the stale copy, then a store replaced it before removal
        cache.store(id, blob(12, 2)).await.unwrap();
        assert!(!cache.remove_if_expired(id).await.unwrap());
        assert_eq!(cache.get(id).await.unwrap(), blob(12, 2));
        assert_eq!(cache.size(), 12);

        set_mtime(&cache.path_for(id), SystemTime::now() - Duration::from_secs(7200));
        assert!(cache.remove_if_expired(id).await.unwrap());
        assert!(!cache.path_for(id).exists());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_filesystem_cache_empty_object_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        let id = Uuid::new_v4();

        cache.store(id, Bytes::new()).await.unwrap();

        assert!(cache.exists(id).await.unwrap());
        assert!(cache.get(id).await.unwrap().is_empty());
        let (mut reader, len) = cache.get_stream(id).await.unwrap();
        assert_eq!(len, 0);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_filesystem_cache_read_extends_ttl() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        let id = Uuid::new_v4();

        cache.store(id, blob(10, 1)).await.unwrap();
        let earlier = SystemTime::now() - Duration::from_secs(1800);
        set_mtime(&cache.path_for(id), earlier);

        cache.get(id).await.unwrap();

        let modified = std::fs::metadata(cache.path_for(id)).unwrap().modified().unwrap();
        assert!(modified > earlier + Duration::from_secs(1700));
    }

    #[tokio::test]
    async fn test_filesystem_cache_strict_ttl() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(FileSystemConfig {
            read_extends_ttl: false,
            ..config(&dir, 1024)
        })
        .await
        .unwrap();
        let id = Uuid::new_v4();

        cache.store(id, blob(10, 1)).await.unwrap();
        let earlier = SystemTime::now() - Duration::from_secs(1800);
        set_mtime(&cache.path_for(id), earlier);

        cache.get(id).await.unwrap();

        let modified = std::fs::metadata(cache.path_for(id)).unwrap().modified().unwrap();
        assert!(modified < earlier + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_filesystem_cache_delete_and_clear() {
        let dir = TempDir::new().unwrap();
        let cache = FileSystemCache::open(config(&dir, 1024)).await.unwrap();
        let id = Uuid::new_v4();

        cache.store(id, blob(10, 1)).await.unwrap();
        cache.delete(id).await.unwrap();
        cache.delete(id).await.unwrap();
        assert_eq!(cache.size(), 0);

        for i in 0..5u8 {
            cache.store(Uuid::new_v4(), blob(10, i)).await.unwrap();
        }
        cache.clear().await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.objects, 0);
        assert_eq!(stats.size_bytes, 0);
        assert!(cache.base_dir().exists());
    }
}
