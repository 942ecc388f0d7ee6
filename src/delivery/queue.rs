//! Durable FIFO retry queue
//!
//! Insertion order is retry order and ids are unique. A message is in the
//! queue exactly until it has been confirmed sent. All mutations, including
//! claiming a flush batch, happen under one lock, and each one is written
//! through to a [`QueueStore`].

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::message::OutboundMessage;
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────

/// Durable storage for queue contents
pub trait QueueStore: Send + Sync {
    /// Load the persisted queue, oldest first
    fn load(&self) -> Result<Vec<OutboundMessage>>;

    /// Replace the persisted queue
    fn save(&self, entries: &[OutboundMessage]) -> Result<()>;

    /// Move unreadable contents out of the way; returns where they went
    fn set_aside(&self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Queue persisted as a JSON array in a single file
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueStore for JsonFileStore {
    fn load(&self) -> Result<Vec<OutboundMessage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| Error::IoRead {
            path: self.path.clone(),
            source: e,
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&content).map_err(|e| Error::queue_store(&self.path, e.to_string()))
    }

    fn save(&self, entries: &[OutboundMessage]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        let data = serde_json::to_vec_pretty(entries)?;
        atomic_write(&self.path, &data)
    }

    fn set_aside(&self) -> Result<Option<PathBuf>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut name = self.path.clone().into_os_string();
        name.push(".corrupt");
        let target = PathBuf::from(name);
        fs::rename(&self.path, &target).map_err(|e| Error::IoWrite {
            path: target.clone(),
            source: e,
        })?;
        Ok(Some(target))
    }
}

/// Write to a sibling temp file, then rename over the target
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, data).map_err(|e| Error::IoWrite {
        path: temp_path.clone(),
        source: e,
    })?;
    fs::rename(&temp_path, path).map_err(|e| Error::IoWrite {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

/// Non-durable store
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<OutboundMessage>>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with existing contents
    pub fn with_entries(entries: Vec<OutboundMessage>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// What was last saved
    pub fn saved(&self) -> Vec<OutboundMessage> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
impl QueueStore for MemoryStore {
    fn load(&self) -> Result<Vec<OutboundMessage>> {
        Ok(self.entries.lock().clone())
    }

    fn save(&self, entries: &[OutboundMessage]) -> Result<()> {
        *self.entries.lock() = entries.to_vec();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────

/// Result of [`RetryQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended; `evicted` is the entry dropped to respect the bound
    Added { evicted: Option<OutboundMessage> },
    /// An entry with the same id is already queued
    Duplicate,
}

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<OutboundMessage>,
    in_flight: HashSet<String>,
}

impl QueueInner {
    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.id == id)
    }

    /// Drop the oldest entry no flush is holding, if there is one
    fn evict_oldest_idle(&mut self) -> Option<OutboundMessage> {
        let index = self
            .entries
            .iter()
            .position(|m| !self.in_flight.contains(&m.id))?;
        self.entries.remove(index)
    }
}

/// Ordered, de-duplicated, persisted queue of unsent messages
///
/// Every mutating call keeps its in-memory effect even when writing to the
/// store fails; the store error is returned so the caller can report it.
pub struct RetryQueue {
    inner: Mutex<QueueInner>,
    store: Box<dyn QueueStore>,
    max_len: usize,
}

impl RetryQueue {
    /// Open a queue, restoring whatever the store holds
    ///
    /// `max_len == 0` means unbounded. When bounded, adding to a full queue
    /// evicts the oldest entry that is not currently being retried. While
    /// every entry is being retried nothing is evicted and the queue may
    /// briefly exceed the bound.
    pub fn open(store: Box<dyn QueueStore>, max_len: usize) -> Result<Self> {
        let entries = store.load()?;
        Ok(Self::with_entries(entries, store, max_len))
    }

    fn with_entries(loaded: Vec<OutboundMessage>, store: Box<dyn QueueStore>, max_len: usize) -> Self {
        let mut inner = QueueInner::default();
        let mut seen = HashSet::new();
        for message in loaded {
            if seen.insert(message.id.clone()) {
                inner.entries.push_back(message);
            } else {
                warn!(id = %message.id, "Dropping duplicate persisted queue entry");
            }
        }

        if !inner.entries.is_empty() {
            debug!(count = inner.entries.len(), "Restored retry queue");
        }

        Self {
            inner: Mutex::new(inner),
            store,
            max_len,
        }
    }

    /// Open a queue, starting empty if the stored contents cannot be read
    ///
    /// Unreadable contents are moved aside by the store so the next write
    /// does not overwrite them.
    pub fn recover(store: Box<dyn QueueStore>, max_len: usize) -> Self {
        let entries = match store.load() {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e.format_for_log(), "Retry queue unreadable; starting empty");
                match store.set_aside() {
                    Ok(Some(path)) => warn!(path = %path.display(), "Unreadable retry queue moved aside"),
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "Failed to move unreadable retry queue aside"),
                }
                Vec::new()
            }
        };

        Self::with_entries(entries, store, max_len)
    }

    /// Unbounded in-memory queue
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            store: Box::new(MemoryStore::new()),
            max_len: 0,
        }
    }

    /// Append a message unless its id is already queued
    pub fn enqueue(&self, message: OutboundMessage) -> Result<EnqueueOutcome> {
        let mut inner = self.inner.lock();
        if inner.position(&message.id).is_some() {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let evicted = if self.max_len > 0 && inner.entries.len() >= self.max_len {
            let evicted = inner.evict_oldest_idle();
            match evicted {
                Some(ref old) => {
                    warn!(id = %old.id, max_len = self.max_len, "Retry queue full; evicted oldest entry")
                }
                None => debug!(max_len = self.max_len, "Retry queue full but every entry is in flight"),
            }
            evicted
        } else {
            None
        };

        inner.entries.push_back(message);
        self.persist(&inner)?;
        Ok(EnqueueOutcome::Added { evicted })
    }

    /// Snapshot the queue for one flush
    ///
    /// Returns, in order, every entry not already claimed by another flush
    /// and marks them in flight. Entries added afterwards are not part of
    /// the batch. Each returned entry must be settled with
    /// [`complete`](Self::complete) or [`release`](Self::release).
    pub fn begin_flush(&self) -> Vec<OutboundMessage> {
        let mut inner = self.inner.lock();
        let batch: Vec<OutboundMessage> = inner
            .entries
            .iter()
            .filter(|m| !inner.in_flight.contains(&m.id))
            .cloned()
            .collect();
        for message in &batch {
            inner.in_flight.insert(message.id.clone());
        }
        batch
    }

    /// Confirm a message was sent; returns whether it was queued
    pub fn complete(&self, id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(id);
        match inner.position(id) {
            Some(index) => {
                inner.entries.remove(index);
                self.persist(&inner)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Return a claimed message to the queue after a failed retry
    ///
    /// `attempted` says whether the transport was actually tried; only
    /// then does the message's `delivery_attempts` go up.
    pub fn release(&self, id: &str, attempted: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(id);
        if !attempted {
            return Ok(());
        }
        if let Some(index) = inner.position(id) {
            inner.entries[index].delivery_attempts += 1;
            self.persist(&inner)?;
        }
        Ok(())
    }

    /// Discard one message
    pub fn remove(&self, id: &str) -> Result<Option<OutboundMessage>> {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(id);
        let removed = match inner.position(id) {
            Some(index) => inner.entries.remove(index),
            None => return Ok(None),
        };
        self.persist(&inner)?;
        Ok(removed)
    }

    /// Discard everything; returns how many entries were dropped
    pub fn clear(&self) -> Result<usize> {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.in_flight.clear();
        self.persist(&inner)?;
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    fn persist(&self, inner: &QueueInner) -> Result<()> {
        let entries: Vec<OutboundMessage> = inner.entries.iter().cloned().collect();
        self.store.save(&entries)
    }
}
