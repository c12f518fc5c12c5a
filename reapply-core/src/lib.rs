//! Core engine for reactive feature application.
//!
//! Features declare *what* they need (argument selectors over named
//! provider keys) and *what* they produce (an apply function); the engine
//! figures out *when* to run them. Everything flows through a synchronous
//! dispatch bus with user middleware, and work is debounced through a
//! deterministic two-lane scheduler.
//!
//! # Core concepts
//!
//! - **[`Feature`]**: a kind tag, target keys, named argument selectors
//!   and an apply function, built via [`Feature::builder`].
//! - **[`Engine`]**: the registry and flush cycles; admits features,
//!   accepts change notifications and announces pruned results.
//! - **[`Action`]**: the bus vocabulary; middleware observe and extend
//!   behavior at the bus, and failures funnel into `error` actions.
//! - **Dependency discovery**: the first evaluation per (feature, target)
//!   pair records which provider keys the selectors read, building the
//!   index that routes later change notifications.
//! - **Memoized invocation**: apply re-runs only when a selector output
//!   actually changed for that pair.
//! - **[`EngineRuntime`]**: optional tokio hosting with channel-fed
//!   change signals and cooperative cancellation.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use reapply_core::prelude::*;
//! use serde_json::json;
//!
//! struct Widget;
//!
//! let engine: Engine<Widget> = Engine::with_middleware(vec![logging_middleware()]);
//! engine.add(Rc::new(
//!     Feature::builder("style")
//!         .target_key("dims")
//!         .arg("width", |bag| bag.value("dims"))
//!         .apply(|args| json!({ "w": args["width"] }))
//!         .build()?,
//! ))?;
//! engine.bootstrap(Rc::new(Widget))?;
//! engine.settle();
//! # Ok::<(), reapply_core::EngineError>(())
//! ```

pub mod action;
pub mod connection;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod feature;
pub mod queue;
pub mod runtime;
pub mod schedule;

pub use action::{
    Action, ActionSummary, BootstrapContext, ClearCacheRequest, EnqueueItem, ProviderHandle,
    Registrar, TargetRequest,
};
pub use connection::Invocation;
pub use dispatch::{logging_middleware, Dispatcher, MiddlewareFactory, MiddlewareFn};
pub use engine::{Engine, FILTER_KEY, SORTER_KEY};
pub use error::EngineError;
pub use feature::{ArgBag, ArgValues, Feature, FeatureBuilder, FeatureId};
pub use queue::{FilterFn, Helper, ResultGroup, ResultSet, SorterFn, TargetSet};
pub use runtime::{EngineRuntime, EngineSignal};
pub use schedule::{Coalesced, Scheduler, Strategy};

/// Dynamic value type used for provider outputs, selector results and
/// apply results.
pub use serde_json::Value;

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::action::{Action, BootstrapContext, EnqueueItem};
    pub use crate::dispatch::{logging_middleware, Dispatcher, MiddlewareFactory};
    pub use crate::engine::Engine;
    pub use crate::error::EngineError;
    pub use crate::feature::{ArgBag, ArgValues, Feature, FeatureId};
    pub use crate::queue::{Helper, ResultSet};
    pub use crate::runtime::{EngineRuntime, EngineSignal};
    pub use crate::Value;
}
