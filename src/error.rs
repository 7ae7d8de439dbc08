//! Rich diagnostic error types for dynload.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! and [`LoadError`] carries them through to the caller with the full
//! diagnostic chain intact.

use miette::Diagnostic;
use thiserror::Error;

use crate::config::ConfigError;
use crate::context::ContextId;
use crate::host::HostError;

/// Top-level error type for loader operations.
#[derive(Debug, Error, Diagnostic)]
pub enum LoadError {
    #[error("unit not found: \"{name}\" (context {context})")]
    #[diagnostic(
        code(dynload::resolve::not_found),
        help(
            "No unit named \"{name}\" is resident in this context, reachable through \
             the resolution scope, known to a parent loader, or present at any \
             search location. Define it first with `define_unit()` or add the \
             location that publishes it with `add_search_location()`."
        )
    )]
    NotFound { name: String, context: ContextId },

    #[error("duplicate definition: \"{name}\" is already live in context {context}")]
    #[diagnostic(
        code(dynload::define::duplicate),
        help(
            "A different unit is still strongly referenced under this name. \
             Drop every handle to the old unit before redefining it, or define \
             the new version in an isolated loader (`DynamicLoader::isolated()`)."
        )
    )]
    DuplicateDefinition { name: String, context: ContextId },

    #[error("context {context} is closed")]
    #[diagnostic(
        code(dynload::context::closed),
        help("A closed loader cannot be reused. Create a new loader for further definitions.")
    )]
    Closed { context: ContextId },

    #[error("generation id allocator exhausted")]
    #[diagnostic(
        code(dynload::constants::generations_exhausted),
        help(
            "Every generation id up to u32::MAX has been handed out. Ids are never \
             reissued because older units may still reference their constant pools. \
             Start a new loader context for further compilation."
        )
    )]
    GenerationsExhausted,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

impl LoadError {
    /// Whether this is a [`LoadError::NotFound`], the one failure the
    /// resolution walk treats as "try the next link".
    pub fn is_not_found(&self) -> bool {
        matches!(self, LoadError::NotFound { .. })
    }
}

/// Convenience result type for loader operations.
pub type LoadResult<T> = std::result::Result<T, LoadError>;
