//! Compiled units: the executable artifacts a loader installs under a name.
//!
//! A [`CompiledUnit`] is shared as a [`UnitHandle`] (`Arc<CompiledUnit>`).
//! Executing code holds the strong handle; a context's cache only holds a
//! `Weak`. When the last strong handle is dropped the unit posts a
//! reclamation notice to the queue of the context it was defined in, so the
//! next eviction sweep can purge the stale mapping.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::context::ContextId;
use crate::context::cache::{ReclaimQueue, Reclaimed};

/// Shared, strong handle to a compiled unit.
pub type UnitHandle = Arc<CompiledUnit>;

/// Process-unique identity of one installed unit.
///
/// Two definitions of the same name never share a `UnitId`, which is what
/// lets the eviction sweep tell a stale entry from a fresher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        UnitId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the underlying `u64` value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unit:{}", self.0)
    }
}

/// Where a unit came from, as reported by the compiler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceMeta {
    /// Source file or buffer name.
    pub path: Option<String>,
    /// 1-based line of the compiled form.
    pub line: u32,
    /// 1-based column of the compiled form.
    pub column: u32,
    /// Printed source form, if the compiler kept it.
    pub form: Option<String>,
}

impl SourceMeta {
    /// Metadata pointing at `path:line:column`.
    pub fn at(path: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            path: Some(path.into()),
            line,
            column,
            form: None,
        }
    }

    /// Attach the printed source form.
    pub fn with_form(mut self, form: impl Into<String>) -> Self {
        self.form = Some(form.into());
        self
    }
}

/// Raw material for a unit: name, executable bytes and optional source
/// metadata. This is what the compiler hands in and what a host hands back
/// when it locates a unit at a search location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub bytes: Arc<[u8]>,
    pub source: Option<SourceMeta>,
}

impl Definition {
    pub fn new(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: SourceMeta) -> Self {
        self.source = Some(source);
        self
    }
}

/// An executable artifact installed under a logical name.
pub struct CompiledUnit {
    id: UnitId,
    name: String,
    context: Option<ContextId>,
    bytes: Arc<[u8]>,
    source: Option<SourceMeta>,
    linked: AtomicBool,
    /// Queue of the defining context; dangling once that context is gone.
    reclaim: Weak<ReclaimQueue>,
}

impl CompiledUnit {
    /// Build a unit owned by `context` that reports its reclamation to `queue`.
    pub(crate) fn monitored(
        definition: Definition,
        context: ContextId,
        queue: &Arc<ReclaimQueue>,
    ) -> UnitHandle {
        Arc::new(Self {
            id: UnitId::next(),
            name: definition.name,
            context: Some(context),
            bytes: definition.bytes,
            source: definition.source,
            linked: AtomicBool::new(false),
            reclaim: Arc::downgrade(queue),
        })
    }

    /// Build a unit that belongs to no context and is not monitored by any
    /// cache. Foreign loaders and hosts use this for units they own outright.
    pub fn detached(definition: Definition) -> UnitHandle {
        Arc::new(Self {
            id: UnitId::next(),
            name: definition.name,
            context: None,
            bytes: definition.bytes,
            source: definition.source,
            linked: AtomicBool::new(false),
            reclaim: Weak::new(),
        })
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The context this unit was defined in, `None` for detached units.
    pub fn context(&self) -> Option<ContextId> {
        self.context
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn source(&self) -> Option<&SourceMeta> {
        self.source.as_ref()
    }

    /// Whether the host has fully linked this unit.
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    /// Record that linking finished. Returns `false` if it already was linked.
    pub fn mark_linked(&self) -> bool {
        !self.linked.swap(true, Ordering::AcqRel)
    }

    /// Whether `bytes` are exactly the bytes this unit was built from.
    pub fn same_bytes(&self, bytes: &[u8]) -> bool {
        &*self.bytes == bytes
    }
}

impl std::fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("context", &self.context)
            .field("len", &self.bytes.len())
            .field("linked", &self.is_linked())
            .finish()
    }
}

impl Drop for CompiledUnit {
    fn drop(&mut self) {
        // The queue only takes a short mutex; never touch the cache map here,
        // the last handle may be dropped while a cache shard is locked.
        if let Some(queue) = self.reclaim.upgrade() {
            queue.notify(Reclaimed {
                name: std::mem::take(&mut self.name),
                unit: self.id,
            });
        }
    }
}
