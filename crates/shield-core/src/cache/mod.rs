//! Per-job state cache
//!
//! Remembers the last telemetry verdict for each running job so that
//! unchanged jobs are not re-queried every cycle. One file per alert scope,
//! written as a versioned JSON-lines document:
//!
//! ```text
//! {"schema":"job-shield/idle-gpu-cache","version":1,"cluster":"della","partitions":"gpu"}
//! {"jobid":"4123","last_checked":1718000000,"idle_gpu_count":0}
//! ```

use crate::models::{JobId, Scope};
use crate::persist::write_atomic;
use crate::policy::RecheckPolicy;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CACHE_SCHEMA: &str = "job-shield/idle-gpu-cache";
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheHeader {
    schema: String,
    version: u32,
    #[serde(default)]
    cluster: String,
    #[serde(default)]
    partitions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub jobid: JobId,
    /// Unix seconds of the sample that produced this entry
    pub last_checked: i64,
    pub idle_gpu_count: u32,
}

impl CacheEntry {
    pub fn is_idle(&self) -> bool {
        self.idle_gpu_count > 0
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let secs = now.timestamp() - self.last_checked;
        Duration::from_secs(secs.max(0) as u64)
    }

    /// Whether the entry may stand in for a fresh telemetry query
    pub fn is_fresh(&self, now: DateTime<Utc>, recheck: &RecheckPolicy) -> bool {
        let interval = if self.is_idle() {
            Some(recheck.idle)
        } else {
            recheck.active
        };
        match interval {
            None => true,
            Some(interval) => self.age(now) < interval,
        }
    }
}

#[derive(Debug, Default)]
pub struct JobStateCache {
    path: Option<PathBuf>,
    scope: Option<Scope>,
    entries: BTreeMap<JobId, CacheEntry>,
}

impl JobStateCache {
    /// In-memory cache that is never persisted
    pub fn ephemeral() -> Self {
        Self::default()
    }

    pub fn file_path(dir: &Path, scope: &Scope) -> PathBuf {
        dir.join(format!(".idle_gpu_cache_{}.jsonl", scope.file_tag()))
    }

    /// Open the cache file for `scope` inside `dir`. The directory must already exist.
    pub fn open(dir: &Path, scope: &Scope) -> Result<Self> {
        if !dir.is_dir() {
            bail!("cache directory {:?} does not exist", dir);
        }
        Self::load(Self::file_path(dir, scope), scope)
    }

    /// Load a cache file for `scope`. A missing file yields an empty cache;
    /// unreadable entries are skipped. An incompatible header, or one written
    /// for a different scope whose file tag collides, discards the file.
    fn load(path: PathBuf, scope: &Scope) -> Result<Self> {
        let mut cache = Self {
            path: Some(path.clone()),
            scope: Some(scope.clone()),
            entries: BTreeMap::new(),
        };

        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No job state cache yet");
                return Ok(cache);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read cache file {:?}", path))
            }
        };

        let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
        match lines.next().map(serde_json::from_str::<CacheHeader>) {
            None => return Ok(cache),
            Some(Ok(header))
                if header.schema == CACHE_SCHEMA
                    && header.version == CACHE_VERSION
                    && header.cluster == scope.cluster
                    && header.partitions == scope.partition_key() => {}
            Some(Ok(header)) if header.schema == CACHE_SCHEMA && header.version == CACHE_VERSION => {
                warn!(
                    path = %path.display(),
                    cluster = %header.cluster,
                    partitions = %header.partitions,
                    "Cache file belongs to another scope, starting fresh"
                );
                return Ok(cache);
            }
            Some(Ok(header)) => {
                warn!(
                    path = %path.display(),
                    schema = %header.schema,
                    version = header.version,
                    "Incompatible cache file, starting fresh"
                );
                return Ok(cache);
            }
            Some(Err(e)) => {
                warn!(path = %path.display(), error = %e, "Cache file has no valid header, starting fresh");
                return Ok(cache);
            }
        }

        let mut skipped = 0usize;
        for line in lines {
            match serde_json::from_str::<CacheEntry>(line) {
                Ok(entry) => {
                    cache.entries.insert(entry.jobid.clone(), entry);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "Skipped unreadable cache entries");
        }

        debug!(path = %path.display(), entries = cache.entries.len(), "Loaded job state cache");
        Ok(cache)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.path.is_some()
    }

    pub fn lookup(&self, jobid: &JobId) -> Option<&CacheEntry> {
        self.entries.get(jobid)
    }

    pub fn record(&mut self, jobid: &JobId, checked_at: DateTime<Utc>, idle_gpu_count: u32) {
        self.entries.insert(
            jobid.clone(),
            CacheEntry {
                jobid: jobid.clone(),
                last_checked: checked_at.timestamp(),
                idle_gpu_count,
            },
        );
    }

    /// Drop entries for jobs no longer running in the scope. Returns the number removed.
    ///
    /// Entries are otherwise never deleted; pruning here keeps the file to the
    /// jobs of the current cycle, the same set a full rewrite would hold.
    pub fn retain_running<'a, I>(&mut self, running: I) -> usize
    where
        I: IntoIterator<Item = &'a JobId>,
    {
        let running: HashSet<&JobId> = running.into_iter().collect();
        let before = self.entries.len();
        self.entries.retain(|jobid, _| running.contains(jobid));
        before - self.entries.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist atomically. No-op for ephemeral caches.
    pub fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let header = CacheHeader {
            schema: CACHE_SCHEMA.to_string(),
            version: CACHE_VERSION,
            cluster: self.scope.as_ref().map(|s| s.cluster.clone()).unwrap_or_default(),
            partitions: self
                .scope
                .as_ref()
                .map(Scope::partition_key)
                .unwrap_or_default(),
        };

        let mut data = serde_json::to_vec(&header).context("Failed to serialize cache header")?;
        data.push(b'\n');
        for entry in self.entries.values() {
            serde_json::to_writer(&mut data, entry).context("Failed to serialize cache entry")?;
            data.push(b'\n');
        }

        write_atomic(path, &data)?;
        info!(path = %path.display(), entries = self.entries.len(), "Flushed job state cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn scope() -> Scope {
        Scope::new("della", ["gpu"])
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut cache = JobStateCache::open(dir.path(), &scope()).unwrap();
        assert!(cache.is_empty());

        cache.record(&JobId::from("55_3"), at(1000), 2);
        cache.record(&JobId::from("56"), at(1100), 0);
        cache.flush().unwrap();

        let reloaded = JobStateCache::open(dir.path(), &scope()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.lookup(&JobId::from("55_3")).unwrap().idle_gpu_count, 2);
        assert_eq!(reloaded.lookup(&JobId::from("56")).unwrap().last_checked, 1100);
    }

    #[test]
    fn test_open_requires_directory() {
        let dir = TempDir::new().unwrap();
        assert!(JobStateCache::open(&dir.path().join("missing"), &scope()).is_err());
    }

    #[test]
    fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = JobStateCache::file_path(dir.path(), &scope());
        std::fs::write(
            &path,
            format!(
                "{{\"schema\":\"{CACHE_SCHEMA}\",\"version\":1,\"cluster\":\"della\",\"partitions\":\"gpu\"}}\n\
                 {{\"jobid\":\"1\",\"last_checked\":10,\"idle_gpu_count\":1}}\n\
                 not json\n\
                 {{\"jobid\":\"2\",\"last_checked\":\"soon\"}}\n"
            ),
        )
        .unwrap();

        let cache = JobStateCache::open(dir.path(), &scope()).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup(&JobId::from("1")).is_some());
    }

    #[test]
    fn test_colliding_scope_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let slashed = Scope::new("della", ["a/b"]);
        let underscored = Scope::new("della", ["a_b"]);
        assert_eq!(
            JobStateCache::file_path(dir.path(), &slashed),
            JobStateCache::file_path(dir.path(), &underscored)
        );

        let mut cache = JobStateCache::open(dir.path(), &slashed).unwrap();
        cache.record(&JobId::from("7"), at(1000), 1);
        cache.flush().unwrap();

        let other = JobStateCache::open(dir.path(), &underscored).unwrap();
        assert!(other.is_empty());
        let same = JobStateCache::open(dir.path(), &slashed).unwrap();
        assert_eq!(same.len(), 1);
    }

    #[test]
    fn test_incompatible_version_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = JobStateCache::file_path(dir.path(), &scope());
        std::fs::write(
            &path,
            format!(
                "{{\"schema\":\"{CACHE_SCHEMA}\",\"version\":99}}\n\
                 {{\"jobid\":\"1\",\"last_checked\":10,\"idle_gpu_count\":1}}\n"
            ),
        )
        .unwrap();

        let cache = JobStateCache::open(dir.path(), &scope()).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_retain_running_drops_finished_jobs() {
        let mut cache = JobStateCache::ephemeral();
        cache.record(&JobId::from("1"), at(0), 0);
        cache.record(&JobId::from("2"), at(0), 1);

        let running = [JobId::from("2")];
        assert_eq!(cache.retain_running(running.iter()), 1);
        assert!(cache.lookup(&JobId::from("1")).is_none());
        assert!(cache.lookup(&JobId::from("2")).is_some());
    }

    #[test]
    fn test_freshness_is_asymmetric() {
        let recheck = RecheckPolicy {
            active: Some(Duration::from_secs(30 * 60)),
            idle: Duration::from_secs(60 * 60),
        };
        let active = CacheEntry {
            jobid: JobId::from("1"),
            last_checked: 0,
            idle_gpu_count: 0,
        };
        let idle = CacheEntry {
            idle_gpu_count: 1,
            ..active.clone()
        };

        assert!(active.is_fresh(at(29 * 60), &recheck));
        assert!(!active.is_fresh(at(30 * 60), &recheck));
        assert!(idle.is_fresh(at(59 * 60), &recheck));
        assert!(!idle.is_fresh(at(60 * 60), &recheck));
    }

    #[test]
    fn test_never_recheck_active() {
        let recheck = RecheckPolicy {
            active: None,
            idle: Duration::ZERO,
        };
        let active = CacheEntry {
            jobid: JobId::from("1"),
            last_checked: 0,
            idle_gpu_count: 0,
        };
        let idle = CacheEntry {
            idle_gpu_count: 2,
            ..active.clone()
        };

        assert!(active.is_fresh(at(1_000_000), &recheck));
        assert!(!idle.is_fresh(at(0), &recheck));
    }

    #[test]
    fn test_ephemeral_flush_is_noop() {
        let mut cache = JobStateCache::ephemeral();
        cache.record(&JobId::from("1"), at(0), 0);
        assert!(cache.flush().is_ok());
        assert!(!cache.is_persistent());
    }
}
