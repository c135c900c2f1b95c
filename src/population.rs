//! Per-key population coordination
//!
//! Two things are tracked for every cache key:
//!
//! - whether a Full Fetch Worker is in flight ([`WorkerTicket`]); at most one
//!   ticket exists per key at a time.
//! - who currently owns the right to append to the data file
//!   ([`WriterLease`]). Ownership, the durable length and the completed flag
//!   live behind one async mutex, and every append happens while holding it
//!   after an ownership check, so a data file never has two writers.
//!
//! A streamer may claim a vacant writer. A worker always takes the writer
//! over, preempting a streamer; the preempted streamer notices on its next
//! append and stops caching. The worker continues from the durable length the
//! streamer left behind.
//!
//! A key stays registered only while something references it, or while it
//! remembers the durable length of a partial data file.

use crate::cache_key::{CacheKey, CachePaths};
use crate::error::{ProxyError, Result};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

/// Which component holds a writer lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterRole {
    Streamer,
    Worker,
}

#[derive(Debug)]
struct LeaseToken {
    role: WriterRole,
}

#[derive(Debug, Default)]
struct WriterState {
    owner: Option<Weak<LeaseToken>>,
    durable_len: u64,
    complete: bool,
}

impl WriterState {
    fn current_owner(&self) -> Option<Arc<LeaseToken>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    fn is_owned_by(&self, token: &Arc<LeaseToken>) -> bool {
        self.current_owner()
            .is_some_and(|owner| Arc::ptr_eq(&owner, token))
    }
}

#[derive(Debug, Default)]
struct PopulationSlot {
    worker_running: AtomicBool,
    writer: tokio::sync::Mutex<WriterState>,
}

type SlotMap = Arc<Mutex<HashMap<CacheKey, Arc<PopulationSlot>>>>;

/// Shared reference to a registered slot
///
/// Every reference to a slot outside the map is a handle. When the last
/// handle goes away the slot is dropped from the map, unless it still carries
/// a durable length for a partial data file that a later worker can resume.
#[derive(Debug, Clone)]
struct SlotHandle {
    key: CacheKey,
    slot: Arc<PopulationSlot>,
    slots: SlotMap,
}

impl Deref for SlotHandle {
    type Target = PopulationSlot;

    fn deref(&self) -> &PopulationSlot {
        &self.slot
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this handle hold the only references; new handles are
        // only created under the map lock, so none can appear concurrently.
        if Arc::strong_count(&self.slot) != 2 {
            return;
        }
        if !slots.get(&self.key).is_some_and(|s| Arc::ptr_eq(s, &self.slot)) {
            return;
        }
        let Ok(state) = self.slot.writer.try_lock() else {
            return;
        };
        if state.complete || state.durable_len == 0 {
            drop(state);
            slots.remove(&self.key);
            debug!("Released population slot key={}", self.key);
        }
    }
}

/// Registry of population slots keyed by [`CacheKey`]
#[derive(Debug, Default)]
pub struct PopulationRegistry {
    slots: SlotMap,
}

impl PopulationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &CacheKey) -> SlotHandle {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(key.clone()).or_default().clone();
        SlotHandle {
            key: key.clone(),
            slot,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of keys currently tracked
    ///
    /// Keys without a worker or writer drop out unless a partial data file
    /// with a known durable length is waiting to be resumed.
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a worker for `key`
    ///
    /// Returns `None` if a worker is already in flight for this key. The
    /// registration ends when the returned ticket is dropped.
    pub fn try_start_worker(&self, key: &CacheKey) -> Option<WorkerTicket> {
        let slot = self.slot(key);
        slot.worker_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        debug!("Registered worker for key={}", key);
        Some(WorkerTicket {
            key: key.clone(),
            slot,
        })
    }

    /// Whether a worker is currently in flight for `key`
    pub fn is_worker_running(&self, key: &CacheKey) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(key)
            .is_some_and(|slot| slot.worker_running.load(Ordering::Acquire))
    }

    /// Claim the writer for a streamer
    ///
    /// Succeeds only when no live writer exists and the entry is not
    /// complete. On success the data file is truncated, since a streamer
    /// always writes from byte 0.
    pub async fn claim_streamer(&self, paths: &CachePaths) -> Result<Option<WriterLease>> {
        let slot = self.slot(&paths.key);
        let mut state = slot.writer.lock().await;

        if state.complete || paths.is_complete().await {
            state.complete = true;
            return Ok(None);
        }
        if state.current_owner().is_some() {
            return Ok(None);
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&paths.data)
            .await?;

        let token = Arc::new(LeaseToken {
            role: WriterRole::Streamer,
        });
        state.owner = Some(Arc::downgrade(&token));
        state.durable_len = 0;
        drop(state);

        debug!("Streamer claimed writer for key={}", paths.key);
        Ok(Some(WriterLease {
            key: paths.key.clone(),
            slot,
            token,
            file,
            written: 0,
        }))
    }
}

/// Registration of an in-flight worker; unregisters on drop
#[derive(Debug)]
pub struct WorkerTicket {
    key: CacheKey,
    slot: SlotHandle,
}

impl WorkerTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Take the writer over, preempting any streamer
    ///
    /// The data file is cut back to the last durably written length and the
    /// returned lease is positioned at its end.
    pub async fn take_over_writer(&self, paths: &CachePaths) -> Result<WriterLease> {
        let mut state = self.slot.writer.lock().await;

        if state.complete {
            return Err(ProxyError::InternalError(format!(
                "cache entry {} is already complete",
                paths.key
            )));
        }

        if let Some(previous) = state.current_owner() {
            info!(
                "Worker preempting {:?} writer for key={} at offset {}",
                previous.role, paths.key, state.durable_len
            );
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&paths.data)
            .await?;
        file.set_len(state.durable_len).await?;
        file.seek(SeekFrom::Start(state.durable_len)).await?;

        let token = Arc::new(LeaseToken {
            role: WriterRole::Worker,
        });
        state.owner = Some(Arc::downgrade(&token));
        let written = state.durable_len;
        drop(state);

        Ok(WriterLease {
            key: paths.key.clone(),
            slot: self.slot.clone(),
            token,
            file,
            written,
        })
    }
}

impl Drop for WorkerTicket {
    fn drop(&mut self) {
        self.slot.worker_running.store(false, Ordering::Release);
        debug!("Unregistered worker for key={}", self.key);
    }
}

/// Exclusive right to append to one cache data file
///
/// The right can be lost to a worker at any time; [`WriterLease::append`]
/// reports that instead of writing.
#[derive(Debug)]
pub struct WriterLease {
    key: CacheKey,
    slot: SlotHandle,
    token: Arc<LeaseToken>,
    file: File,
    written: u64,
}

impl WriterLease {
    pub fn role(&self) -> WriterRole {
        self.token.role
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Bytes durably written through this lease's view of the file
    pub fn offset(&self) -> u64 {
        self.written
    }

    /// Append a chunk at the current end of the data file
    ///
    /// Returns `Ok(false)` without writing if the lease was preempted.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<bool> {
        let mut state = self.slot.writer.lock().await;
        if !state.is_owned_by(&self.token) {
            return Ok(false);
        }

        self.file.write_all(chunk).await?;
        self.file.flush().await?;

        self.written += chunk.len() as u64;
        state.durable_len = self.written;
        Ok(true)
    }

    /// Discard everything written so far and restart at offset 0
    pub async fn reset(&mut self) -> Result<()> {
        let mut state = self.slot.writer.lock().await;
        if !state.is_owned_by(&self.token) {
            return Err(ProxyError::InternalError(format!(
                "writer lease for {} lost before reset",
                self.key
            )));
        }

        self.file.set_len(0).await?;
        self.file.seek(SeekFrom::Start(0)).await?;
        self.written = 0;
        state.durable_len = 0;
        Ok(())
    }

    /// Flush the data file to stable storage and give the writer up
    pub async fn finish(self) -> Result<()> {
        let mut state = self.slot.writer.lock().await;
        if state.is_owned_by(&self.token) {
            self.file.sync_data().await?;
            state.owner = None;
        }
        Ok(())
    }

    /// Sync the data file and publish the completion marker
    ///
    /// After this the entry is complete and no lease can be claimed for it.
    pub async fn commit(self, paths: &CachePaths) -> Result<u64> {
        let mut state = self.slot.writer.lock().await;
        if !state.is_owned_by(&self.token) {
            return Err(ProxyError::InternalError(format!(
                "writer lease for {} lost before commit",
                self.key
            )));
        }

        self.file.sync_all().await?;
        paths.write_marker(self.written).await?;
        state.complete = true;
        state.owner = None;
        Ok(self.written)
    }
}
