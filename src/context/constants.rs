//! Per-generation constant pools.
//!
//! Compiled units reference their literal constants by a numeric
//! [`GenerationId`] handed out by the compiler, never by unit name: a name can
//! be redefined while older code still needs the pool it was compiled with.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};

/// Compiler-assigned id of one compiled top-level form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct GenerationId(u32);

impl GenerationId {
    pub const fn new(raw: u32) -> Self {
        GenerationId(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl From<u32> for GenerationId {
    fn from(raw: u32) -> Self {
        GenerationId(raw)
    }
}

impl std::fmt::Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen:{}", self.0)
    }
}

/// Thread-safe generation id allocator for compilers.
///
/// Produces monotonically increasing ids starting from 1. Ids are never
/// reissued: once `u32::MAX` has been handed out the allocator is exhausted.
#[derive(Debug)]
pub struct GenerationAllocator {
    next: AtomicU64,
}

impl GenerationAllocator {
    pub fn new() -> Self {
        Self::starting_from(1)
    }

    /// Resume allocation at `start`, e.g. after loading ahead-of-time output
    /// that already used the lower ids.
    pub fn starting_from(start: u32) -> Self {
        Self {
            next: AtomicU64::new(u64::from(start.max(1))),
        }
    }

    /// Allocate the next id.
    ///
    /// Returns an error once the id space is exhausted.
    pub fn next_id(&self) -> LoadResult<GenerationId> {
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n <= u64::from(u32::MAX)).then_some(n + 1)
            })
            .ok()
            .and_then(|raw| u32::try_from(raw).ok())
            .map(GenerationId)
            .ok_or(LoadError::GenerationsExhausted)
    }

    /// Return the id that *would* be allocated next, without consuming it.
    ///
    /// `None` once the allocator is exhausted.
    pub fn peek_next(&self) -> Option<GenerationId> {
        u32::try_from(self.next.load(Ordering::Acquire))
            .ok()
            .map(GenerationId)
    }
}

impl Default for GenerationAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A literal value in a constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Symbol(String),
    Keyword(String),
    Bytes(Vec<u8>),
    List(Vec<Constant>),
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Nil => write!(f, "nil"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Int(i) => write!(f, "{i}"),
            Constant::Float(x) => write!(f, "{x}"),
            Constant::Str(s) => write!(f, "{s:?}"),
            Constant::Symbol(s) => write!(f, "{s}"),
            Constant::Keyword(k) => write!(f, ":{k}"),
            Constant::Bytes(b) => write!(f, "#bytes[{}]", b.len()),
            Constant::List(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Constant pools of one context, keyed by generation.
///
/// Pools are never evicted individually; they live until the context closes.
#[derive(Debug, Default)]
pub struct ConstantPool {
    pools: DashMap<GenerationId, Arc<[Constant]>>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pools: DashMap::with_capacity(capacity),
        }
    }

    /// Store the pool for `id`, returning the one it replaced.
    pub fn register(
        &self,
        id: GenerationId,
        values: impl Into<Arc<[Constant]>>,
    ) -> Option<Arc<[Constant]>> {
        self.pools.insert(id, values.into())
    }

    pub fn get(&self, id: GenerationId) -> Option<Arc<[Constant]>> {
        self.pools.get(&id).map(|r| Arc::clone(r.value()))
    }

    pub fn clear(&self) {
        self.pools.clear();
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
