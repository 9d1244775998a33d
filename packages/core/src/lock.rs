//! Reader/writer leases on individual streams.
//!
//! A stream admits either any number of readers or exactly one writer. Each
//! open handle owns a [`Lease`]; dropping the lease releases the slot, so no
//! exit path can leave an orphaned lock behind. Leases can also be revoked
//! from the outside (forced delete, database close), after which the holder
//! observes them as dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{poisoned, Result};
use crate::path::Path;
use crate::stream_type::StreamType;

/// How stream acquisition reacts to a conflicting holder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LockPolicy {
    /// Fail with `ResourceBusy` immediately.
    #[default]
    FailFast,
    /// Wait up to `timeout_ms` for the holder to release.
    Block { timeout_ms: u64 },
}

impl LockPolicy {
    pub fn block(timeout: Duration) -> Self {
        LockPolicy::Block {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    Shared,
    Exclusive,
}

/// Identity of a lockable stream.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct StreamKey {
    pub path: Path,
    pub stream_type: StreamType,
}

struct Holder {
    id: u64,
    live: Arc<AtomicBool>,
}

#[derive(Default)]
struct Slot {
    writer: Option<Holder>,
    readers: Vec<Holder>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }

    fn holders(&self) -> impl Iterator<Item = &Holder> {
        self.writer.iter().chain(self.readers.iter())
    }
}

#[derive(Default)]
struct LockState {
    slots: HashMap<StreamKey, Slot>,
    next_id: u64,
    /// Bumped on every release so waiters can tell whether to retry.
    generation: u64,
}

/// Outcome of a non-blocking acquisition attempt.
pub enum TryAcquire {
    Acquired(Lease),
    /// Held by someone else; carries the generation to wait on.
    Busy(u64),
}

/// Table of open stream leases for one database.
#[derive(Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Try to take a lease without waiting.
    pub fn try_acquire(self: &Arc<Self>, key: &StreamKey, mode: LeaseMode) -> Result<TryAcquire> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let generation = state.generation;
        let free = match state.slots.get(key) {
            None => true,
            Some(slot) => match mode {
                LeaseMode::Shared => slot.writer.is_none(),
                LeaseMode::Exclusive => slot.is_empty(),
            },
        };
        if !free {
            return Ok(TryAcquire::Busy(generation));
        }

        state.next_id += 1;
        let id = state.next_id;
        let live = Arc::new(AtomicBool::new(true));
        let holder = Holder {
            id,
            live: live.clone(),
        };
        let slot = state.slots.entry(key.clone()).or_default();
        match mode {
            LeaseMode::Shared => slot.readers.push(holder),
            LeaseMode::Exclusive => slot.writer = Some(holder),
        }

        Ok(TryAcquire::Acquired(Lease {
            table: self.clone(),
            key: key.clone(),
            id,
            mode,
            live,
        }))
    }

    /// Block until a release happens after `generation`, or `deadline`
    /// passes. Returns `false` on timeout.
    pub fn wait_for_release(&self, generation: u64, deadline: Instant) -> Result<bool> {
        let mut state = self.state.lock().map_err(poisoned)?;
        while state.generation == generation {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (next, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .map_err(poisoned)?;
            state = next;
        }
        Ok(true)
    }

    /// Whether any stream at or below `prefix` has an open lease.
    pub fn is_busy_under(&self, prefix: &Path) -> Result<bool> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state
            .slots
            .iter()
            .any(|(key, slot)| key.path.has_prefix(prefix) && !slot.is_empty()))
    }

    pub fn is_busy(&self, key: &StreamKey) -> Result<bool> {
        let state = self.state.lock().map_err(poisoned)?;
        Ok(state.slots.get(key).is_some_and(|slot| !slot.is_empty()))
    }

    /// Revoke every lease at or below `prefix`. Returns how many were revoked.
    pub fn revoke_under(&self, prefix: &Path) -> Result<usize> {
        self.revoke_where(|key| key.path.has_prefix(prefix))
    }

    /// Revoke the leases on exactly `key`. Returns how many were revoked.
    pub fn revoke(&self, key: &StreamKey) -> Result<usize> {
        self.revoke_where(|candidate| candidate == key)
    }

    fn revoke_where(&self, doomed: impl Fn(&StreamKey) -> bool) -> Result<usize> {
        let mut state = self.state.lock().map_err(poisoned)?;
        let keys: Vec<StreamKey> = state.slots.keys().filter(|key| doomed(key)).cloned().collect();
        let mut revoked = 0;
        for key in keys {
            if let Some(slot) = state.slots.remove(&key) {
                for holder in slot.holders() {
                    holder.live.store(false, Ordering::SeqCst);
                    revoked += 1;
                }
            }
        }
        state.generation += 1;
        self.released.notify_all();
        Ok(revoked)
    }

    fn release(&self, key: &StreamKey, id: u64) {
        // A poisoned table can no longer be trusted by anyone; nothing useful
        // to do from a destructor.
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(slot) = state.slots.get_mut(key) {
            if slot.writer.as_ref().is_some_and(|w| w.id == id) {
                slot.writer = None;
            }
            slot.readers.retain(|r| r.id != id);
            if slot.is_empty() {
                state.slots.remove(key);
            }
        }
        state.generation += 1;
        self.released.notify_all();
    }
}

/// A held read or write slot on one stream. Released on drop.
pub struct Lease {
    table: Arc<LockTable>,
    key: StreamKey,
    id: u64,
    mode: LeaseMode,
    live: Arc<AtomicBool>,
}

impl Lease {
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn mode(&self) -> LeaseMode {
        self.mode
    }

    /// False once the lease has been revoked.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table.release(&self.key, self.id);
    }
}
