//! Error taxonomy for the engine
//!
//! Two propagation paths exist (see [`crate::dispatch`] for the second):
//!
//! - **Validation errors** are returned synchronously from the public
//!   surface (`FeatureBuilder::build`, `Engine::add`, `Engine::config`,
//!   `Engine::bootstrap`) and never caught internally.
//! - **Runtime dispatch errors** are caught at the dispatch boundary and
//!   converted into an `error` action so observability middleware can
//!   react uniformly. Nothing is retried.

use thiserror::Error;

/// Errors produced by the engine.
///
/// `Clone + PartialEq` so errors can travel inside cloned actions and be
/// asserted on in tests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Feature `kind` was empty or whitespace-only.
    #[error("feature `kind` must be a non-empty string")]
    EmptyKind,

    /// Feature `target_keys` was empty or contained an empty entry.
    #[error("feature `target_keys` must be a non-empty list of non-empty strings")]
    InvalidTargetKeys,

    /// Feature was built without an apply function.
    #[error("feature requires an `apply` function")]
    MissingApply,

    /// A feature already admitted by a different engine was added.
    #[error("feature already belongs to another engine")]
    ForeignFeature,

    /// `config` was called with an empty key.
    #[error("config keys must be non-empty strings")]
    InvalidConfigKey,

    /// `bootstrap` was called a second time.
    #[error("engine already bootstrapped")]
    AlreadyBootstrapped,

    /// A `core:change-occurred` action named a key with no registered
    /// argument provider.
    #[error("no value provider has been registered for `{0}`")]
    MissingProvider(String),

    /// A caller-supplied middleware reported a failure.
    #[error("{0}")]
    Middleware(String),
}

impl EngineError {
    /// Wrap an arbitrary middleware failure message.
    pub fn middleware(message: impl Into<String>) -> Self {
        EngineError::Middleware(message.into())
    }
}
