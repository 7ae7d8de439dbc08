// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # dynload
//!
//! In-process dynamic code loading and caching. A compiler emits units at
//! runtime, installs them under a logical name, and retrieves them on demand;
//! units are evicted automatically once nothing strongly references them.
//!
//! ## Architecture
//!
//! - **Contexts** (`context`): isolation records owning a weak unit cache,
//!   per-generation constant pools and a reclamation queue
//! - **Eviction sweep** (`context::cache`): purges reclaimed entries before
//!   every definition
//! - **Resolution chain** (`chain`): explicit override scopes walked toward
//!   the root context
//! - **Host boundary** (`host`): the environment that actually installs and
//!   links code
//! - **Loader** (`loader`): the public facade tying it all together
//!
//! ## Library usage
//!
//! ```
//! use std::sync::Arc;
//! use dynload::chain::ResolutionScope;
//! use dynload::host::MemoryHost;
//! use dynload::loader::DynamicLoader;
//!
//! let host = Arc::new(MemoryHost::new());
//! let root = DynamicLoader::root(host);
//! let repl = DynamicLoader::isolated(&root);
//!
//! let unit = repl.define_unit("user$eval1", vec![0xCAu8, 0xFE], None).unwrap();
//! let found = repl.resolve("user$eval1", &ResolutionScope::new()).unwrap();
//! assert!(Arc::ptr_eq(&unit, &found));
//! ```

pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod loader;
pub mod unit;

pub use error::{LoadError, LoadResult};
