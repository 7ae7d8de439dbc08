//! Weak unit cache with a reclamation queue and the eviction sweep.
//!
//! The cache maps names to `Weak` handles. Units post a [`Reclaimed`] notice
//! to the [`ReclaimQueue`] from their `Drop`; [`UnitCache::sweep`] drains the
//! queue and removes a mapping only when it still points at the exact unit
//! that was reclaimed, so a fresher definition under the same name survives.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::error::LoadResult;
use crate::unit::{CompiledUnit, UnitHandle, UnitId};

/// Notice that the unit `unit`, cached as `name`, lost its last strong handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub name: String,
    pub unit: UnitId,
}

/// Pending reclamation notices for one context.
#[derive(Debug, Default)]
pub struct ReclaimQueue {
    pending: Mutex<Vec<Reclaimed>>,
}

impl ReclaimQueue {
    pub(crate) fn notify(&self, notice: Reclaimed) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice);
    }

    /// Take every pending notice.
    pub fn drain(&self) -> Vec<Reclaimed> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *pending)
    }

    /// Number of notices waiting for the next sweep.
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct CacheEntry {
    unit: UnitId,
    handle: Weak<CompiledUnit>,
}

/// Name → monitored unit mapping for one context.
#[derive(Debug)]
pub struct UnitCache {
    entries: DashMap<String, CacheEntry>,
    queue: Arc<ReclaimQueue>,
}

impl UnitCache {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            queue: Arc::new(ReclaimQueue::default()),
        }
    }

    /// The queue units defined through this cache report to.
    pub fn queue(&self) -> &Arc<ReclaimQueue> {
        &self.queue
    }

    /// Drain the reclamation queue and purge the entries it names.
    ///
    /// Returns the number of mappings removed.
    pub fn sweep(&self) -> usize {
        let notices = self.queue.drain();
        if notices.is_empty() {
            return 0;
        }
        let mut purged = 0;
        for notice in &notices {
            if self
                .entries
                .remove_if(&notice.name, |_, entry| entry.unit == notice.unit)
                .is_some()
            {
                purged += 1;
            }
        }
        tracing::debug!(
            notices = notices.len(),
            purged,
            "eviction sweep"
        );
        purged
    }

    /// Look up a live unit. A stale entry is removed and reported as absent.
    pub fn get(&self, name: &str) -> Option<UnitHandle> {
        let stale = match self.entries.get(name) {
            Some(entry) => match entry.handle.upgrade() {
                Some(unit) => return Some(unit),
                None => entry.unit,
            },
            None => return None,
        };
        self.entries
            .remove_if(name, |_, entry| entry.unit == stale && entry.handle.strong_count() == 0);
        None
    }

    /// Atomically install a unit under `name`.
    ///
    /// `make` receives the currently live unit (if any) while the entry for
    /// `name` is held, and returns the unit that should be resident. If it
    /// hands back the live unit unchanged, the entry is left alone.
    pub fn insert_with<F>(&self, name: &str, make: F) -> LoadResult<UnitHandle>
    where
        F: FnOnce(Option<UnitHandle>) -> LoadResult<UnitHandle>,
    {
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().handle.upgrade();
                let live_id = live.as_ref().map(|u| u.id());
                let unit = make(live)?;
                if live_id != Some(unit.id()) {
                    occupied.insert(CacheEntry {
                        unit: unit.id(),
                        handle: Arc::downgrade(&unit),
                    });
                }
                Ok(unit)
            }
            Entry::Vacant(vacant) => {
                let unit = make(None)?;
                vacant.insert(CacheEntry {
                    unit: unit.id(),
                    handle: Arc::downgrade(&unit),
                });
                Ok(unit)
            }
        }
    }

    /// Drop every mapping. Pending notices are discarded too.
    pub fn clear(&self) {
        self.entries.clear();
        self.queue.drain();
    }

    /// Number of mappings, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of entries whose unit is still live (snapshot).
    pub fn live_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.handle.strong_count() > 0)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl Default for UnitCache {
    fn default() -> Self {
        Self::new()
    }
}
