//! Resolution chain walk over explicitly passed override contexts.
//!
//! An execution thread owns a [`ResolutionScope`]: a stack of override
//! contexts it pushes while re-evaluating code in a sandbox. Every resolution
//! call receives the scope as a parameter; nothing is discovered through
//! thread-local state.
//!
//! The chain for a scope is each override (innermost first) followed by its
//! ancestors, with contexts already visited skipped. It always ends at the
//! root context, so an empty scope searches the root alone.

use std::collections::HashSet;
use std::sync::Arc;

use crate::context::{Context, ContextId};
use crate::unit::UnitHandle;

/// Stack of override contexts for one execution thread.
#[derive(Debug, Clone, Default)]
pub struct ResolutionScope {
    overrides: Vec<Arc<Context>>,
}

impl ResolutionScope {
    /// An empty scope: resolution falls through to the root context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope with `context` as its only override.
    pub fn with_active(context: Arc<Context>) -> Self {
        Self {
            overrides: vec![context],
        }
    }

    pub fn push(&mut self, context: Arc<Context>) {
        self.overrides.push(context);
    }

    pub fn pop(&mut self) -> Option<Arc<Context>> {
        self.overrides.pop()
    }

    /// Run `f` with `context` pushed, popping it again afterwards.
    pub fn with_override<R>(&mut self, context: Arc<Context>, f: impl FnOnce(&mut Self) -> R) -> R {
        let depth = self.overrides.len();
        self.overrides.push(context);
        let result = f(self);
        self.overrides.truncate(depth);
        result
    }

    /// The innermost override, if any.
    pub fn active(&self) -> Option<&Arc<Context>> {
        self.overrides.last()
    }

    pub fn depth(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// The contexts a chain walk visits, in order.
    pub fn chain(&self) -> Vec<Arc<Context>> {
        let mut seen: HashSet<ContextId> = HashSet::new();
        let mut chain = Vec::new();
        for ctx in self.overrides.iter().rev() {
            for link in std::iter::once(ctx).chain(ctx.ancestors()) {
                if seen.insert(link.id()) {
                    chain.push(Arc::clone(link));
                }
            }
        }
        let root = Context::root();
        if seen.insert(root.id()) {
            chain.push(Arc::clone(root));
        }
        chain
    }
}

/// Return the first live unit named `name` along the scope's chain.
pub fn resolve_via_chain(scope: &ResolutionScope, name: &str) -> Option<UnitHandle> {
    for ctx in scope.chain() {
        if ctx.is_closed() {
            continue;
        }
        if let Some(unit) = ctx.cache().get(name) {
            tracing::trace!(name, context = %ctx.id(), "resolved via chain");
            return Some(unit);
        }
    }
    None
}
