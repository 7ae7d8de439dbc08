//! The host environment boundary.
//!
//! A loader never installs code by itself: it hands every new unit to a
//! [`HostEnvironment`], which owns the primitive "install these bytes as a
//! named executable unit", the table of units it has already loaded, native
//! lookup at search locations, and linking. [`MemoryHost`] is the in-process
//! implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextId;
use crate::unit::{CompiledUnit, Definition, UnitHandle};

/// Errors reported by a host environment.
#[derive(Debug, Error, Diagnostic)]
pub enum HostError {
    #[error("host already has a live unit \"{name}\" in context {context}")]
    #[diagnostic(
        code(dynload::host::already_defined),
        help("The host refuses a second distinct unit under one name per context.")
    )]
    AlreadyDefined { name: String, context: ContextId },

    #[error("failed to link \"{name}\": {reason}")]
    #[diagnostic(
        code(dynload::host::link_failed),
        help(
            "The unit was installed but could not be linked. \
             Check that the compiler emitted a complete unit."
        )
    )]
    LinkFailed { name: String, reason: String },

    #[error("host rejected \"{name}\": {reason}")]
    #[diagnostic(
        code(dynload::host::rejected),
        help("The host environment refused to install the unit's bytes.")
    )]
    Rejected { name: String, reason: String },
}

pub type HostResult<T> = std::result::Result<T, HostError>;

/// A place the host can search for units a loader does not have yet.
///
/// Locations are opaque to the loader: it only keeps them in order and
/// passes them to [`HostEnvironment::locate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchLocation(String);

impl SearchLocation {
    pub fn new(location: impl Into<String>) -> Self {
        SearchLocation(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SearchLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SearchLocation {
    fn from(s: &str) -> Self {
        SearchLocation(s.to_string())
    }
}

impl From<String> for SearchLocation {
    fn from(s: String) -> Self {
        SearchLocation(s)
    }
}

/// The code-loading facility a loader installs units into.
pub trait HostEnvironment: Send + Sync + std::fmt::Debug {
    /// Install `unit` under its name in `context`.
    ///
    /// Must fail with [`HostError::AlreadyDefined`] if a distinct unit with
    /// the same name is still live in that context.
    fn install(&self, context: ContextId, unit: &UnitHandle) -> HostResult<()>;

    /// A unit this host has already loaded into `context`, if still live.
    fn find_loaded(&self, context: ContextId, name: &str) -> Option<UnitHandle>;

    /// Native lookup: find raw material for `name` at one of `locations`,
    /// searched in order.
    fn locate(&self, name: &str, locations: &[SearchLocation]) -> Option<Definition>;

    /// Fully link `unit`. Called at most once per unit by the loader.
    fn link(&self, unit: &CompiledUnit) -> HostResult<()>;

    /// Forget everything held on behalf of `context`.
    fn release(&self, context: ContextId);
}

/// In-process host: tracks installed units weakly per context and serves
/// definitions published under search locations.
#[derive(Debug, Default)]
pub struct MemoryHost {
    loaded: DashMap<(ContextId, String), Weak<CompiledUnit>>,
    published: DashMap<SearchLocation, HashMap<String, Definition>>,
    installs: AtomicU64,
    links: AtomicU64,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `definition` findable at `location`.
    pub fn publish(&self, location: impl Into<SearchLocation>, definition: Definition) {
        let location = location.into();
        tracing::debug!(%location, name = %definition.name, "published unit");
        self.published
            .entry(location)
            .or_default()
            .insert(definition.name.clone(), definition);
    }

    /// Number of successful installs so far.
    pub fn install_count(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    /// Number of successful links so far.
    pub fn link_count(&self) -> u64 {
        self.links.load(Ordering::Relaxed)
    }
}

impl HostEnvironment for MemoryHost {
    fn install(&self, context: ContextId, unit: &UnitHandle) -> HostResult<()> {
        if unit.bytes().is_empty() {
            return Err(HostError::Rejected {
                name: unit.name().to_string(),
                reason: "unit has no bytes".into(),
            });
        }
        match self.loaded.entry((context, unit.name().to_string())) {
            Entry::Occupied(mut occupied) => {
                if let Some(live) = occupied.get().upgrade() {
                    if !Arc::ptr_eq(&live, unit) {
                        return Err(HostError::AlreadyDefined {
                            name: unit.name().to_string(),
                            context,
                        });
                    }
                    return Ok(());
                }
                occupied.insert(Arc::downgrade(unit));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::downgrade(unit));
            }
        }
        self.installs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn find_loaded(&self, context: ContextId, name: &str) -> Option<UnitHandle> {
        let key = (context, name.to_string());
        let unit = self.loaded.get(&key).and_then(|weak| weak.upgrade());
        if unit.is_none() {
            self.loaded.remove_if(&key, |_, weak| weak.strong_count() == 0);
        }
        unit
    }

    fn locate(&self, name: &str, locations: &[SearchLocation]) -> Option<Definition> {
        locations.iter().find_map(|location| {
            self.published
                .get(location)
                .and_then(|bundle| bundle.get(name).cloned())
        })
    }

    fn link(&self, unit: &CompiledUnit) -> HostResult<()> {
        if unit.mark_linked() {
            self.links.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn release(&self, context: ContextId) {
        self.loaded.retain(|(ctx, _), _| *ctx != context);
    }
}
