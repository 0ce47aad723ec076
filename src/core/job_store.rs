//! Durable job records with append-only event history.
//!
//! `FileJobStore` keeps one directory per job: `job.json` holds the record and
//! `events.jsonl` holds the event history as newline-delimited JSON, which keeps
//! the history easy to inspect by hand. `MemoryJobStore` offers the same
//! contract in-process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::domain::{Job, JobUpdate, LogEvent};
use crate::error::StoreError;

/// Default number of events retained per job
pub const DEFAULT_EVENT_RETENTION: usize = 5000;

/// One page of persisted events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<LogEvent>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
}

/// Storage contract for job records and their event history
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new job record
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Find a job by internal or external id
    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Apply a status update, enforcing monotonic transitions
    async fn update_status(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError>;

    /// Append events in order as a single write.
    ///
    /// Fails with `StoreError::NotFound` while the job record does not exist.
    async fn append_events(&self, id: &str, events: &[LogEvent]) -> Result<(), StoreError>;

    /// Persisted events ordered by timestamp, 1-based pages
    async fn list_events(&self, id: &str, page: usize, limit: usize) -> Result<EventPage, StoreError>;

    /// Most recently created jobs first
    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError>;
}

/// Sort and slice events into a page
fn paginate(mut events: Vec<LogEvent>, page: usize, limit: usize) -> EventPage {
    let page = page.max(1);
    let limit = limit.max(1);

    events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
    let total = events.len();
    let events = events
        .into_iter()
        .skip((page - 1).saturating_mul(limit))
        .take(limit)
        .collect();

    EventPage {
        events,
        page,
        limit,
        total,
    }
}

/// File-based job store
pub struct FileJobStore {
    /// Directory containing one subdirectory per job
    root: PathBuf,

    /// Maximum events kept per job before the oldest are trimmed
    retention: usize,

    /// Per-job write guards, dropped once no writer holds them
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Ids become directory names; only a single plain path segment is accepted
fn is_storable_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl FileJobStore {
    /// Open (or create) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            retention: DEFAULT_EVENT_RETENTION,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Override the per-job event retention
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    fn job_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn job_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join("job.json")
    }

    fn events_path(&self, id: &str) -> PathBuf {
        self.job_dir(id).join("events.jsonl")
    }

    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Give back a guard handle, removing the map entry if nobody else holds it
    async fn unlock(&self, id: &str, handle: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(handle);
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    async fn has_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.job_path(id)).await?)
    }

    async fn read_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let path = self.job_path(id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Write job.json via temp file + rename so readers never see a torn record
    async fn write_job(&self, job: &Job) -> Result<(), StoreError> {
        let path = self.job_path(&job.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(job)?;
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_events(&self, id: &str) -> Result<Vec<LogEvent>, StoreError> {
        let path = self.events_path(id);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&path).await?;
        let mut events = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    /// Resolve an internal or external id to the internal id
    async fn resolve_id(&self, key: &str) -> Result<Option<String>, StoreError> {
        if !is_storable_id(key) {
            return Ok(None);
        }
        if self.has_job(key).await? {
            return Ok(Some(key.to_string()));
        }
        if !key.starts_with("dep-") {
            return Ok(None);
        }

        // External ids are looked up by scanning records
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Some(job) = self.read_job(name).await? {
                    if job.external_id == key {
                        return Ok(Some(job.id));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn create_locked(&self, job: &Job) -> Result<(), StoreError> {
        if self.has_job(&job.id).await? {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        fs::create_dir_all(self.job_dir(&job.id)).await?;
        self.write_job(job).await
    }

    async fn update_locked(&self, internal: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let mut job = self
            .read_job(internal)
            .await?
            .ok_or_else(|| StoreError::NotFound(internal.to_string()))?;
        job.apply(update)?;
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn append_locked(&self, id: &str, events: &[LogEvent]) -> Result<(), StoreError> {
        let mut job = self
            .read_job(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path(id))
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;

        job.event_count += events.len() as u64;

        // Retention trim: rewrite keeping the newest events
        if job.event_count as usize > self.retention {
            let all = self.read_events(id).await?;
            let keep = &all[all.len().saturating_sub(self.retention)..];
            let mut trimmed = Vec::new();
            for event in keep {
                serde_json::to_writer(&mut trimmed, event)?;
                trimmed.push(b'\n');
            }
            let tmp = self.events_path(id).with_extension("jsonl.tmp");
            fs::write(&tmp, trimmed).await?;
            fs::rename(&tmp, self.events_path(id)).await?;
            job.event_count = keep.len() as u64;
        }

        self.write_job(&job).await
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        if !is_storable_id(&job.id) {
            return Err(StoreError::InvalidId(job.id.clone()));
        }

        let handle = self.lock_for(&job.id).await;
        let result = {
            let _guard = handle.lock().await;
            self.create_locked(job).await
        };
        self.unlock(&job.id, handle).await;
        result
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        match self.resolve_id(id).await? {
            Some(internal) => self.read_job(&internal).await,
            None => Ok(None),
        }
    }

    async fn update_status(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let internal = self
            .resolve_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let handle = self.lock_for(&internal).await;
        let result = {
            let _guard = handle.lock().await;
            self.update_locked(&internal, update).await
        };
        self.unlock(&internal, handle).await;
        result
    }

    async fn append_events(&self, id: &str, events: &[LogEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        if !is_storable_id(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }

        let handle = self.lock_for(id).await;
        let result = {
            let _guard = handle.lock().await;
            self.append_locked(id, events).await
        };
        self.unlock(id, handle).await;
        result
    }

    async fn list_events(&self, id: &str, page: usize, limit: usize) -> Result<EventPage, StoreError> {
        let internal = self
            .resolve_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let events = self.read_events(&internal).await?;
        Ok(paginate(events, page, limit))
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Some(job) = self.read_job(name).await? {
                        jobs.push(job);
                    }
                }
            }
        }

        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

/// In-memory job store
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<String, Job>>,
    events: RwLock<HashMap<String, Vec<LogEvent>>>,
    retention: usize,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            retention: DEFAULT_EVENT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    async fn resolve_id(&self, key: &str) -> Option<String> {
        let jobs = self.jobs.read().await;
        if jobs.contains_key(key) {
            return Some(key.to_string());
        }
        jobs.values()
            .find(|job| job.matches_id(key))
            .map(|job| job.id.clone())
    }

    /// All persisted events for a job, in stored order
    pub async fn events(&self, id: &str) -> Vec<LogEvent> {
        self.events
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let Some(internal) = self.resolve_id(id).await else {
            return Ok(None);
        };
        Ok(self.jobs.read().await.get(&internal).cloned())
    }

    async fn update_status(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let internal = self
            .resolve_id(id)
            .await
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&internal)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        job.apply(update)?;
        Ok(job.clone())
    }

    async fn append_events(&self, id: &str, events: &[LogEvent]) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut all = self.events.write().await;
        let history = all.entry(id.to_string()).or_default();
        history.extend_from_slice(events);
        if history.len() > self.retention {
            let excess = history.len() - self.retention;
            history.drain(..excess);
        }
        job.event_count = history.len() as u64;
        Ok(())
    }

    async fn list_events(&self, id: &str, page: usize, limit: usize) -> Result<EventPage, StoreError> {
        let internal = self
            .resolve_id(id)
            .await
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(paginate(self.events(&internal).await, page, limit))
    }

    async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobParams, JobStatus, LogKind};
    use tempfile::TempDir;

    fn sample_job() -> Job {
        Job::new(JobParams {
            source_ref: "acme/site".to_string(),
            branch: "main".to_string(),
            ..Default::default()
        })
    }

    async fn create_test_store() -> (FileJobStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::open(temp_dir.path().join("jobs")).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_create_and_get_by_either_id() {
        let (store, _temp) = create_test_store().await;
        let job = sample_job();
        store.create(&job).await.unwrap();

        let by_id = store.get(&job.id).await.unwrap().unwrap();
        let by_external = store.get(&job.external_id).await.unwrap().unwrap();
        assert_eq!(by_id.id, job.id);
        assert_eq!(by_external.id, job.id);

        assert!(store.get("dep-00000000").await.unwrap().is_none());
        assert!(matches!(
            store.create(&job).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_append_requires_record() {
        let (store, _temp) = create_test_store().await;
        let event = LogEvent::new("missing", 0, LogKind::Info, "early");

        let err = store.append_events("missing", &[event]).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_append_preserves_order_across_batches() {
        let (store, _temp) = create_test_store().await;
        let job = sample_job();
        store.create(&job).await.unwrap();

        let first: Vec<LogEvent> = (0..3)
            .map(|i| LogEvent::new(&job.id, i, LogKind::Info, format!("event {}", i)))
            .collect();
        let second: Vec<LogEvent> = (3..5)
            .map(|i| LogEvent::new(&job.id, i, LogKind::Info, format!("event {}", i)))
            .collect();
        store.append_events(&job.id, &first).await.unwrap();
        store.append_events(&job.id, &second).await.unwrap();

        let page = store.list_events(&job.id, 1, 100).await.unwrap();
        assert_eq!(page.total, 5);
        let seqs: Vec<u64> = page.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.event_count, 5);
    }

    #[tokio::test]
    async fn test_pagination() {
        let (store, _temp) = create_test_store().await;
        let job = sample_job();
        store.create(&job).await.unwrap();

        let events: Vec<LogEvent> = (0..7)
            .map(|i| LogEvent::new(&job.id, i, LogKind::Info, format!("event {}", i)))
            .collect();
        store.append_events(&job.id, &events).await.unwrap();

        let page2 = store.list_events(&job.external_id, 2, 3).await.unwrap();
        assert_eq!(page2.total, 7);
        let seqs: Vec<u64> = page2.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);

        let page4 = store.list_events(&job.id, 4, 3).await.unwrap();
        assert!(page4.events.is_empty());
    }

    #[tokio::test]
    async fn test_retention_trims_oldest() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::open(temp_dir.path()).await.unwrap().with_retention(3);
        let job = sample_job();
        store.create(&job).await.unwrap();

        let events: Vec<LogEvent> = (0..5)
            .map(|i| LogEvent::new(&job.id, i, LogKind::Info, format!("event {}", i)))
            .collect();
        store.append_events(&job.id, &events).await.unwrap();

        let page = store.list_events(&job.id, 1, 10).await.unwrap();
        let seqs: Vec<u64> = page.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_status_update_is_monotonic() {
        let (store, _temp) = create_test_store().await;
        let job = sample_job();
        store.create(&job).await.unwrap();

        store
            .update_status(&job.id, JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();
        let failed = store
            .update_status(&job.external_id, JobUpdate::failed("boom"))
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);

        let err = store
            .update_status(&job.id, JobUpdate::status(JobStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_ids_cannot_leave_the_store_root() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileJobStore::open(temp_dir.path().join("jobs")).await.unwrap();
        let sibling = FileJobStore::open(temp_dir.path().join("other")).await.unwrap();
        let job = sample_job();
        sibling.create(&job).await.unwrap();

        let escaped = format!("../other/{}", job.id);
        assert!(store.get(&escaped).await.unwrap().is_none());
        assert!(store.list_events(&escaped, 1, 10).await.unwrap_err().is_not_found());
        assert!(store
            .update_status(&escaped, JobUpdate::status(JobStatus::Running))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.get("..").await.unwrap().is_none());

        let mut bad = sample_job();
        bad.id = "../escape".to_string();
        assert!(matches!(store.create(&bad).await, Err(StoreError::InvalidId(_))));
        assert!(!temp_dir.path().join("escape").exists());
    }

    #[tokio::test]
    async fn test_write_guards_are_dropped_after_use() {
        let (store, _temp) = create_test_store().await;
        let job = sample_job();
        store.create(&job).await.unwrap();
        store
            .append_events(&job.id, &[LogEvent::new(&job.id, 0, LogKind::Info, "queued")])
            .await
            .unwrap();
        store
            .update_status(&job.id, JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();

        assert!(store.locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryJobStore::new().with_retention(2);
        let job = sample_job();

        let early = LogEvent::new(&job.id, 0, LogKind::Info, "early");
        assert!(store.append_events(&job.id, &[early.clone()]).await.unwrap_err().is_not_found());

        store.create(&job).await.unwrap();
        let more = vec![
            early,
            LogEvent::new(&job.id, 1, LogKind::Info, "one"),
            LogEvent::new(&job.id, 2, LogKind::Info, "two"),
        ];
        store.append_events(&job.id, &more).await.unwrap();

        let events = store.events(&job.id).await;
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.list_jobs(10).await.unwrap().len(), 1);
    }
}
