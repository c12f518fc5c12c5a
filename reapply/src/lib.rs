//! reapply: reactive feature application over arbitrary targets
//!
//! Declare features (argument selectors plus an apply function), register
//! argument providers at bootstrap, and notify the engine when a provider
//! key changes; the engine discovers dependencies, memoizes invocations
//! and announces only results that actually changed.
//!
//! # Example
//! ```
//! use std::rc::Rc;
//! use reapply::prelude::*;
//! use serde_json::json;
//!
//! struct Widget;
//!
//! let engine: Engine<Widget> = Engine::new();
//! engine.add(Rc::new(
//!     Feature::builder("style")
//!         .target_key("dims")
//!         .arg("width", |bag| bag.value("dims"))
//!         .apply(|args| json!({ "w": args["width"] }))
//!         .build()?,
//! ))?;
//! engine.bootstrap(Rc::new(Widget))?;
//! engine.settle();
//! # Ok::<(), reapply::EngineError>(())
//! ```

// Re-export everything from core
pub use reapply_core::*;

/// Prelude for convenient imports
pub mod prelude {
    // Features
    pub use reapply_core::{ArgBag, ArgValues, Feature, FeatureBuilder, FeatureId};

    // Engine and helpers
    pub use reapply_core::{Engine, EngineError, Helper, ResultGroup, ResultSet, Value};

    // Dispatch bus
    pub use reapply_core::{
        logging_middleware, Action, BootstrapContext, Dispatcher, EnqueueItem, MiddlewareFactory,
    };

    // Async hosting
    pub use reapply_core::{EngineRuntime, EngineSignal};
}
