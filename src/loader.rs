//! The dynamic loader: define, find, resolve and load compiled units.
//!
//! A [`DynamicLoader`] wraps a [`Context`] and a delegate parent. Loaders are
//! either root-scoped (bound to [`Context::root`]) or derived from a
//! [`Parent`]; a derived loader whose parent is itself a `DynamicLoader`
//! shares that parent's context, any other parent gets a fresh context under
//! the root.
//!
//! Resolution order for [`DynamicLoader::resolve`]:
//!
//! 1. units resident in this loader's context,
//! 2. units the host already loaded into this context,
//! 3. the caller's [`ResolutionScope`] chain,
//! 4. the delegate parent,
//! 5. this loader's own search locations (located by the host, then defined
//!    here).
//!
//! Steps 1–5 run under one per-loader lock, so concurrent first-use
//! resolutions of a name can never install it twice.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::chain::{self, ResolutionScope};
use crate::config::LoaderConfig;
use crate::context::{Constant, Context, ContextId, ContextStats, GenerationId};
use crate::error::{LoadError, LoadResult};
use crate::host::{HostEnvironment, HostError, SearchLocation};
use crate::unit::{CompiledUnit, Definition, SourceMeta, UnitHandle};

/// An enclosing resolver outside this crate's control.
pub trait ForeignLoader: Send + Sync + std::fmt::Debug {
    /// Resolve `name`, or `None` if this loader does not know it.
    fn resolve(&self, name: &str) -> Option<UnitHandle>;
}

/// The loader a derived loader delegates to.
#[derive(Debug, Clone)]
pub enum Parent {
    /// Another dynamic loader; its context is shared by default.
    Dynamic(Arc<DynamicLoader>),
    /// A foreign resolver; the derived loader gets a fresh context.
    Foreign(Arc<dyn ForeignLoader>),
}

/// Position of a loader in the delegation chain.
#[derive(Debug, Clone)]
pub enum LoaderKind {
    /// Bound to the root context; nothing to delegate to.
    Root,
    Derived(Parent),
}

/// Loader for runtime-generated code within one context.
#[derive(Debug)]
pub struct DynamicLoader {
    kind: LoaderKind,
    context: Arc<Context>,
    host: Arc<dyn HostEnvironment>,
    search_locations: RwLock<Vec<SearchLocation>>,
    resolve_lock: Mutex<()>,
}

impl DynamicLoader {
    fn build(
        kind: LoaderKind,
        context: Arc<Context>,
        locations: Vec<SearchLocation>,
        host: Arc<dyn HostEnvironment>,
    ) -> Arc<Self> {
        tracing::debug!(
            context = %context.id(),
            root = matches!(kind, LoaderKind::Root),
            locations = locations.len(),
            "loader created"
        );
        Arc::new(Self {
            kind,
            context,
            host,
            search_locations: RwLock::new(locations),
            resolve_lock: Mutex::new(()),
        })
    }

    /// A root-scoped loader bound to the process-wide root context.
    pub fn root(host: Arc<dyn HostEnvironment>) -> Arc<Self> {
        Self::build(LoaderKind::Root, Arc::clone(Context::root()), Vec::new(), host)
    }

    /// A loader delegating to `parent`, searching `locations` last.
    ///
    /// Shares the parent's context when the parent is a `DynamicLoader`,
    /// otherwise starts a fresh context under the root.
    pub fn create(
        parent: Parent,
        locations: impl IntoIterator<Item = SearchLocation>,
        host: Arc<dyn HostEnvironment>,
    ) -> Arc<Self> {
        let context = match &parent {
            Parent::Dynamic(loader) => Arc::clone(&loader.context),
            Parent::Foreign(_) => Context::child_of(Context::root()),
        };
        Self::build(
            LoaderKind::Derived(parent),
            context,
            locations.into_iter().collect(),
            host,
        )
    }

    /// A loader delegating to `parent` in an explicitly supplied context.
    pub fn with_context(
        parent: Option<Parent>,
        context: Arc<Context>,
        locations: impl IntoIterator<Item = SearchLocation>,
        host: Arc<dyn HostEnvironment>,
    ) -> Arc<Self> {
        let kind = parent.map_or(LoaderKind::Root, LoaderKind::Derived);
        Self::build(kind, context, locations.into_iter().collect(), host)
    }

    /// A same-family child sharing `parent`'s context and host.
    pub fn child(parent: &Arc<DynamicLoader>) -> Arc<Self> {
        Self::create(
            Parent::Dynamic(Arc::clone(parent)),
            Vec::new(),
            Arc::clone(&parent.host),
        )
    }

    /// A child with its own fresh context nested under `parent`'s.
    ///
    /// Units defined here are invisible to the parent and to siblings; the
    /// parent's units stay reachable through delegation and scope chains.
    /// This is the loader to push as an override for sandboxed re-evaluation.
    pub fn isolated(parent: &Arc<DynamicLoader>) -> Arc<Self> {
        let context = Context::child_of(&parent.context);
        Self::build(
            LoaderKind::Derived(Parent::Dynamic(Arc::clone(parent))),
            context,
            Vec::new(),
            Arc::clone(&parent.host),
        )
    }

    /// Build a loader from configuration.
    pub fn from_config(
        config: &LoaderConfig,
        parent: Option<Parent>,
        host: Arc<dyn HostEnvironment>,
    ) -> Arc<Self> {
        let locations = config.locations();
        let fresh = |under: &Arc<Context>| {
            Context::child_with_capacity(under, config.cache_capacity, config.constants_capacity)
        };
        let (kind, context) = match parent {
            None => (LoaderKind::Root, Arc::clone(Context::root())),
            Some(Parent::Dynamic(loader)) => {
                let context = if config.isolate {
                    fresh(&loader.context)
                } else {
                    Arc::clone(&loader.context)
                };
                (LoaderKind::Derived(Parent::Dynamic(loader)), context)
            }
            Some(foreign @ Parent::Foreign(_)) => {
                (LoaderKind::Derived(foreign), fresh(Context::root()))
            }
        };
        tracing::info!(
            context = %context.id(),
            locations = locations.len(),
            isolate = config.isolate,
            "loader configured"
        );
        Self::build(kind, context, locations, host)
    }

    /// Build a loader from a TOML configuration file.
    pub fn from_config_file(
        path: &Path,
        parent: Option<Parent>,
        host: Arc<dyn HostEnvironment>,
    ) -> LoadResult<Arc<Self>> {
        let config = LoaderConfig::load(path)?;
        Ok(Self::from_config(&config, parent, host))
    }

    pub fn kind(&self) -> &LoaderKind {
        &self.kind
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn context_id(&self) -> ContextId {
        self.context.id()
    }

    pub fn host(&self) -> &Arc<dyn HostEnvironment> {
        &self.host
    }

    // -----------------------------------------------------------------------
    // Definition and local lookup
    // -----------------------------------------------------------------------

    /// Install `bytes` as the unit `name` in this loader's context.
    ///
    /// Runs the eviction sweep first. Redefining a name whose unit is still
    /// live fails with [`LoadError::DuplicateDefinition`], unless the bytes
    /// are identical, in which case the live unit is returned.
    pub fn define_unit(
        &self,
        name: &str,
        bytes: impl Into<Arc<[u8]>>,
        source: Option<SourceMeta>,
    ) -> LoadResult<UnitHandle> {
        let mut definition = Definition::new(name, bytes);
        definition.source = source;
        self.define(definition)
    }

    /// [`define_unit`](Self::define_unit) for a prepared [`Definition`].
    pub fn define(&self, definition: Definition) -> LoadResult<UnitHandle> {
        let ctx = &self.context;
        if ctx.is_closed() {
            tracing::warn!(context = %ctx.id(), name = %definition.name, "define on closed context");
            return Err(LoadError::Closed { context: ctx.id() });
        }
        ctx.cache().sweep();

        let name = definition.name.clone();
        ctx.cache().insert_with(&name, |live| {
            if let Some(live) = live {
                if live.same_bytes(&definition.bytes) {
                    return Ok(live);
                }
                return Err(LoadError::DuplicateDefinition {
                    name: name.clone(),
                    context: ctx.id(),
                });
            }
            // Checked again under the entry lock: `close` sets the flag before
            // clearing, so a define racing it either sees the flag here or has
            // its entry removed by the clear.
            if ctx.is_closed() {
                return Err(LoadError::Closed { context: ctx.id() });
            }
            let unit = CompiledUnit::monitored(definition, ctx.id(), ctx.cache().queue());
            self.host.install(ctx.id(), &unit).map_err(|e| match e {
                HostError::AlreadyDefined { name, context } => {
                    LoadError::DuplicateDefinition { name, context }
                }
                other => other.into(),
            })?;
            tracing::debug!(name = %name, unit = %unit.id(), context = %ctx.id(), "unit defined");
            Ok(unit)
        })
    }

    /// Look `name` up in this loader's context only.
    pub fn find_resident(&self, name: &str) -> Option<UnitHandle> {
        let cache = self.context.cache();
        if !cache.queue().is_empty() {
            cache.sweep();
        }
        cache.get(name)
    }

    /// Walk `scope`'s override chain for `name`.
    pub fn resolve_via_chain(&self, scope: &ResolutionScope, name: &str) -> Option<UnitHandle> {
        chain::resolve_via_chain(scope, name)
    }

    /// Names of the live units resident in this loader's context.
    pub fn resident_names(&self) -> Vec<String> {
        self.context.cache().live_names()
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.resolve_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `name` through local residency, the host's loaded table,
    /// `scope`'s chain, the delegate parent and finally this loader's search
    /// locations. Fails with [`LoadError::NotFound`] when all are exhausted.
    pub fn resolve(&self, name: &str, scope: &ResolutionScope) -> LoadResult<UnitHandle> {
        let _guard = self.lock();
        self.resolve_locked(name, Some(scope))
    }

    /// Load `name` for execution, linking it first when `link` is set.
    ///
    /// Idempotent: a unit the host already loaded is returned as is, and a
    /// unit is linked at most once.
    pub fn load_for_execution(
        &self,
        name: &str,
        link: bool,
        scope: &ResolutionScope,
    ) -> LoadResult<UnitHandle> {
        let _guard = self.lock();
        let unit = match self.host.find_loaded(self.context.id(), name) {
            Some(unit) => unit,
            None => self.resolve_locked(name, Some(scope))?,
        };
        if link && !unit.is_linked() {
            self.host.link(&unit)?;
            tracing::debug!(name, unit = %unit.id(), "unit linked");
        }
        Ok(unit)
    }

    /// Resolution as seen by a child delegating to this loader: the caller
    /// already walked its scope chain, so it is not walked again.
    fn resolve_delegated(&self, name: &str) -> LoadResult<UnitHandle> {
        let _guard = self.lock();
        self.resolve_locked(name, None)
    }

    fn resolve_locked(&self, name: &str, scope: Option<&ResolutionScope>) -> LoadResult<UnitHandle> {
        if let Some(unit) = self.find_resident(name) {
            return Ok(unit);
        }
        if let Some(unit) = self.host.find_loaded(self.context.id(), name) {
            return Ok(unit);
        }
        if let Some(unit) = scope.and_then(|scope| chain::resolve_via_chain(scope, name)) {
            return Ok(unit);
        }
        if let Some(unit) = self.delegate(name)? {
            return Ok(unit);
        }
        if let Some(definition) = self.locate(name) {
            tracing::debug!(name, context = %self.context.id(), "defining unit from search location");
            return self.define(definition);
        }
        Err(LoadError::NotFound {
            name: name.to_string(),
            context: self.context.id(),
        })
    }

    fn delegate(&self, name: &str) -> LoadResult<Option<UnitHandle>> {
        let parent = match &self.kind {
            LoaderKind::Root => return Ok(None),
            LoaderKind::Derived(parent) => parent,
        };
        match parent {
            Parent::Dynamic(loader) => match loader.resolve_delegated(name) {
                Ok(unit) => Ok(Some(unit)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            },
            Parent::Foreign(foreign) => Ok(foreign.resolve(name)),
        }
    }

    fn locate(&self, name: &str) -> Option<Definition> {
        let locations = self
            .search_locations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if locations.is_empty() {
            return None;
        }
        self.host.locate(name, &locations)
    }

    // -----------------------------------------------------------------------
    // Constants and search locations
    // -----------------------------------------------------------------------

    /// Store the constant pool of generation `id`, replacing any previous one.
    pub fn register_constants(
        &self,
        id: GenerationId,
        values: impl Into<Arc<[Constant]>>,
    ) -> LoadResult<()> {
        if self.context.is_closed() {
            tracing::warn!(context = %self.context.id(), generation = %id, "constants on closed context");
            return Err(LoadError::Closed {
                context: self.context.id(),
            });
        }
        self.context.constants().register(id, values);
        Ok(())
    }

    pub fn get_constants(&self, id: GenerationId) -> Option<Arc<[Constant]>> {
        self.context.constants().get(id)
    }

    /// Append a search location. Locations are never removed.
    pub fn add_search_location(&self, location: impl Into<SearchLocation>) {
        self.search_locations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(location.into());
    }

    pub fn search_locations(&self) -> Vec<SearchLocation> {
        self.search_locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Clear this loader's context and release the host's resources for it.
    ///
    /// Safe to call more than once. A root-scoped loader never clears the
    /// root context, which lives for the whole process.
    pub fn close(&self) {
        let id = self.context.id();
        if id.is_root() {
            tracing::debug!("close on root-scoped loader leaves the root context intact");
            return;
        }
        if self.context.close() {
            self.host.release(id);
            tracing::info!(context = %id, "loader closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_closed()
    }

    pub fn stats(&self) -> ContextStats {
        self.context.stats()
    }
}
