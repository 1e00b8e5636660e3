use crate::job::{BatchJob, Job};
use crate::{EngineError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime};

pub type JobStore = RecordTable<Job>;
pub type JobWriter = RecordWriter<Job>;
pub type BatchStore = RecordTable<BatchJob>;
pub type BatchWriter = RecordWriter<BatchJob>;

/// Cancel flag shared with the detached worker that owns a record.
pub struct TaskHandle {
    cancel: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new(cancel: Arc<AtomicBool>) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

}

struct Entry<T> {
    record: Arc<T>,
    created_at: SystemTime,
    task: Option<TaskHandle>,
}

/// In-memory keyed table of records.
///
/// Each write replaces the whole `Arc<T>`, so a reader holding a snapshot never sees a
/// half-applied update. Writes go only through the [`RecordWriter`] returned by `create`.
pub struct RecordTable<T> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Entry<T>>>,
}

impl<T: Clone> RecordTable<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry<T>>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry<T>>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create(self: &Arc<Self>, id: impl Into<String>, initial: T) -> Result<RecordWriter<T>> {
        let id = id.into();
        let mut entries = self.write();
        if entries.contains_key(&id) {
            return Err(EngineError::InvalidRequest(format!(
                "{} id already exists: {id}",
                self.kind
            )));
        }
        entries.insert(
            id.clone(),
            Entry {
                record: Arc::new(initial),
                created_at: SystemTime::now(),
                task: None,
            },
        );
        Ok(RecordWriter {
            table: Arc::clone(self),
            id,
        })
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.read().get(id).map(|entry| Arc::clone(&entry.record))
    }

    pub fn require(&self, id: &str) -> Result<Arc<T>> {
        self.get(id).ok_or_else(|| EngineError::NotFound {
            kind: self.kind,
            id: id.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Drops a record without touching its task.
    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.write().remove(id).map(|entry| entry.record)
    }

    pub fn attach_task(&self, id: &str, task: TaskHandle) -> bool {
        match self.write().get_mut(id) {
            Some(entry) => {
                entry.task = Some(task);
                true
            }
            None => false,
        }
    }

    /// Raises the cancel flag of the record's task. False when there is nothing to cancel.
    pub fn cancel(&self, id: &str) -> bool {
        match self.read().get(id).and_then(|entry| entry.task.as_ref()) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Removes records created at least `max_age` ago and cancels their tasks.
    pub fn sweep_older_than(&self, max_age: Duration) -> Vec<(String, Arc<T>)> {
        let now = SystemTime::now();
        let mut entries = self.write();
        let stale: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| {
                now.duration_since(entry.created_at).unwrap_or_default() >= max_age
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(entry) = entries.remove(&id) {
                if let Some(task) = &entry.task {
                    task.cancel();
                }
                removed.push((id, entry.record));
            }
        }
        removed
    }

    fn update_record<R>(&self, id: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut entries = self.write();
        let entry = entries.get_mut(id)?;
        let mut next = (*entry.record).clone();
        let out = f(&mut next);
        entry.record = Arc::new(next);
        Some(out)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, by: Duration) {
        if let Some(entry) = self.write().get_mut(id) {
            entry.created_at = entry.created_at.checked_sub(by).unwrap_or(SystemTime::UNIX_EPOCH);
        }
    }
}

/// Sole write capability for one record. Deliberately not `Clone`.
pub struct RecordWriter<T> {
    table: Arc<RecordTable<T>>,
    id: String,
}

impl<T: Clone> RecordWriter<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Applies `f` to a copy of the record and publishes the copy. `None` once swept.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.table.update_record(&self.id, f)
    }

    pub fn snapshot(&self) -> Option<Arc<T>> {
        self.table.get(&self.id)
    }
}
