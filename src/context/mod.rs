//! Loader contexts: the isolation records units are cached in.
//!
//! A [`Context`] owns a weak [`UnitCache`] and a [`ConstantPool`]. Contexts
//! form a tree rooted at the process-wide [`Context::root`]; closing one
//! empties it for good without touching its siblings or ancestors.

pub mod cache;
pub mod constants;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

pub use cache::{ReclaimQueue, Reclaimed, UnitCache};
pub use constants::{Constant, ConstantPool, GenerationAllocator, GenerationId};

/// Identifier of a context. `ContextId::ROOT` is reserved for the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ContextId(u64);

impl ContextId {
    pub const ROOT: ContextId = ContextId(0);

    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx:{}", self.0)
    }
}

/// Point-in-time counters for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    pub id: ContextId,
    /// Cache mappings, stale ones not yet swept included.
    pub resident: usize,
    pub constants: usize,
    pub pending_reclamations: usize,
    pub closed: bool,
}

/// An isolation domain owning a unit cache and a constants table.
#[derive(Debug)]
pub struct Context {
    id: ContextId,
    parent: Option<Arc<Context>>,
    cache: UnitCache,
    constants: ConstantPool,
    closed: AtomicBool,
}

static ROOT: OnceLock<Arc<Context>> = OnceLock::new();

impl Context {
    /// The process-lifetime root context. It has no parent.
    pub fn root() -> &'static Arc<Context> {
        ROOT.get_or_init(|| {
            Arc::new(Context {
                id: ContextId::ROOT,
                parent: None,
                cache: UnitCache::new(),
                constants: ConstantPool::new(),
                closed: AtomicBool::new(false),
            })
        })
    }

    /// A fresh context whose parent is `parent`.
    pub fn child_of(parent: &Arc<Context>) -> Arc<Context> {
        Self::child_with_capacity(parent, 0, 0)
    }

    /// A fresh child context with pre-sized tables.
    pub fn child_with_capacity(
        parent: &Arc<Context>,
        cache_capacity: usize,
        constants_capacity: usize,
    ) -> Arc<Context> {
        let ctx = Arc::new(Context {
            id: ContextId::next(),
            parent: Some(Arc::clone(parent)),
            cache: UnitCache::with_capacity(cache_capacity),
            constants: ConstantPool::with_capacity(constants_capacity),
            closed: AtomicBool::new(false),
        });
        tracing::debug!(context = %ctx.id, parent = %parent.id, "context created");
        ctx
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    /// Iterate this context's ancestors, nearest first, ending at the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &Arc<Context>> {
        std::iter::successors(self.parent.as_ref(), |&ctx| ctx.parent.as_ref())
    }

    pub fn cache(&self) -> &UnitCache {
        &self.cache
    }

    pub fn constants(&self) -> &ConstantPool {
        &self.constants
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Empty the cache, then the constants, and refuse further use.
    ///
    /// The two tables are cleared one after the other; a concurrent reader
    /// can observe an empty cache next to a still populated constants table.
    /// Returns `false` if the context was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cache.clear();
        self.constants.clear();
        true
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            id: self.id,
            resident: self.cache.len(),
            constants: self.constants.len(),
            pending_reclamations: self.cache.queue().len(),
            closed: self.is_closed(),
        }
    }
}
