//! The engine: registry, debounced flush cycles, and the terminal handler
//!
//! [`Engine`] owns every moving part: the middleware [`Pipeline`], the
//! feature registry, the key → feature index, the provider table, the
//! memoized invocation cache and the apply queue. All mutation flows
//! through dispatched [`Action`]s ending at the engine's terminal handler.
//!
//! Four independent debounced triggers drive the reactive cycle:
//!
//! 1. **bootstrap** announces the root target and registrar once.
//! 2. **features-added** batches admissions into one announcement.
//! 3. **key-change** collects changed provider keys, asks the bus to
//!    populate targets for the affected features, and enqueues the work.
//!    This is the only trigger on the slower tick lane, so a burst of
//!    change notifications coalesces across intervening turn work.
//! 4. **queue-flush** drains the apply queue through the memoized
//!    invocation path and announces pruned results.
//!
//! Every flush drains its accumulated state *before* doing any work, so
//! state produced while the flush runs lands in the next cycle instead of
//! being lost or double-processed.
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
//! let engine: Engine<Widget> = Engine::new();
//! let feature = Rc::new(
//!     Feature::builder("style")
//!         .target_key("dims")
//!         .arg("width", |bag| bag.value("dims"))
//!         .apply(|args| json!({ "w": args["width"] }))
//!         .build()?,
//! );
//! engine.add(feature)?;
//! engine.bootstrap(Rc::new(Widget))?;
//! engine.settle();
//! # Ok::<(), reapply_core::EngineError>(())
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use crate::action::{Action, BootstrapContext, Registrar, TargetRequest};
use crate::connection::{Connections, KeyIndex, Providers};
use crate::dispatch::{Dispatcher, EngineHub, MiddlewareFactory, Pipeline};
use crate::error::EngineError;
use crate::feature::{Feature, FeatureId, ProviderFn};
use crate::queue::{allowed, sort_pending, ApplyQueue, FilterFn, Helper, ResultBuilder, SorterFn};
use crate::schedule::{Coalesced, Scheduler, Strategy};

/// Helper key consumed as enqueue filters.
pub const FILTER_KEY: &str = "filter";
/// Helper key consumed as evaluation-order sorters.
pub const SORTER_KEY: &str = "sorter";

/// The reactive feature-application engine.
///
/// Single-threaded; `T` is the target type features are applied to.
/// Cloning shares the same engine.
pub struct Engine<T: 'static> {
    inner: Rc<EngineInner<T>>,
}

pub(crate) struct EngineInner<T: 'static> {
    pipeline: Pipeline<T>,
    scheduler: Rc<Scheduler>,
    bootstrapped: Cell<bool>,
    pending_bootstrap: RefCell<Option<Rc<T>>>,
    next_id: Cell<u64>,
    features: RefCell<Vec<Rc<Feature<T>>>>,
    added: RefCell<Vec<Rc<Feature<T>>>>,
    changed_keys: RefCell<BTreeSet<String>>,
    helpers: RefCell<HashMap<String, Vec<Helper<T>>>>,
    apply_queue: RefCell<ApplyQueue<T>>,
    providers: RefCell<Providers<T>>,
    key_index: RefCell<KeyIndex<T>>,
    connections: Connections<T>,
    announce_bootstrap: Coalesced,
    announce_added: Coalesced,
    key_change: Coalesced,
    queue_flush: Coalesced,
    self_weak: Weak<EngineInner<T>>,
}

impl<T: 'static> Engine<T> {
    /// Create an engine with no middleware installed.
    pub fn new() -> Self {
        Self::with_middleware(Vec::new())
    }

    /// Create an engine and install middleware.
    ///
    /// Factories are invoked with a dispatcher bound to the new engine.
    /// Actions walk middleware in reverse installation order, so the last
    /// factory in the list sees every action first.
    pub fn with_middleware(factories: Vec<MiddlewareFactory<T>>) -> Self {
        let scheduler = Rc::new(Scheduler::new());
        let inner = Rc::new_cyclic(|weak: &Weak<EngineInner<T>>| {
            let flush = |weak: &Weak<EngineInner<T>>, f: fn(&EngineInner<T>)| {
                let weak = weak.clone();
                move || {
                    if let Some(inner) = weak.upgrade() {
                        f(&inner);
                    }
                }
            };
            EngineInner {
                pipeline: Pipeline::new(),
                scheduler: scheduler.clone(),
                bootstrapped: Cell::new(false),
                pending_bootstrap: RefCell::new(None),
                next_id: Cell::new(0),
                features: RefCell::new(Vec::new()),
                added: RefCell::new(Vec::new()),
                changed_keys: RefCell::new(BTreeSet::new()),
                helpers: RefCell::new(HashMap::new()),
                apply_queue: RefCell::new(ApplyQueue::new()),
                providers: RefCell::new(Providers::new()),
                key_index: RefCell::new(KeyIndex::new()),
                connections: Connections::new(),
                announce_bootstrap: Coalesced::new(
                    scheduler.clone(),
                    Strategy::NextTurn,
                    flush(weak, EngineInner::flush_bootstrap),
                ),
                announce_added: Coalesced::new(
                    scheduler.clone(),
                    Strategy::NextTurn,
                    flush(weak, EngineInner::flush_added),
                ),
                key_change: Coalesced::new(
                    scheduler.clone(),
                    Strategy::NextTick,
                    flush(weak, EngineInner::flush_key_changes),
                ),
                queue_flush: Coalesced::new(
                    scheduler.clone(),
                    Strategy::NextTurn,
                    flush(weak, EngineInner::flush_apply_queue),
                ),
                self_weak: weak.clone(),
            }
        });

        let dispatcher = Dispatcher::new(
            Rc::downgrade(&inner) as Weak<dyn EngineHub<T>>
        );
        for factory in factories {
            inner.pipeline.install(factory(dispatcher.clone()));
        }

        Self { inner }
    }

    /// Validate and admit a feature.
    ///
    /// Admission is synchronous (the feature gets its id before this
    /// returns); the `core:features-added` announcement is debounced so a
    /// burst of adds produces one batched announcement.
    pub fn add(&self, feature: Rc<Feature<T>>) -> Result<&Self, EngineError> {
        feature.validate()?;
        if feature.id().is_some() && !self.inner.knows(&feature) {
            return Err(EngineError::ForeignFeature);
        }
        self.inner.dispatch_ref(&Action::AddFeatures(vec![feature]));
        Ok(self)
    }

    /// Register a named helper.
    ///
    /// The engine consumes helpers under [`FILTER_KEY`] and [`SORTER_KEY`];
    /// other keys are carried for middleware.
    pub fn config(&self, key: impl Into<String>, helper: Helper<T>) -> Result<&Self, EngineError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(EngineError::InvalidConfigKey);
        }
        self.inner
            .helpers
            .borrow_mut()
            .entry(key)
            .or_default()
            .push(helper);
        Ok(self)
    }

    /// The helpers registered under `key`, in registration order.
    pub fn helpers_for(&self, key: &str) -> Vec<Helper<T>> {
        self.inner
            .helpers
            .borrow()
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Start the engine with its root target. One-shot; the
    /// `core:bootstrap` announcement itself is deferred to the next turn.
    pub fn bootstrap(&self, target: Rc<T>) -> Result<&Self, EngineError> {
        if self.inner.bootstrapped.replace(true) {
            return Err(EngineError::AlreadyBootstrapped);
        }
        *self.inner.pending_bootstrap.borrow_mut() = Some(target);
        self.inner.announce_bootstrap.trigger();
        Ok(self)
    }

    /// Whether [`bootstrap`](Self::bootstrap) has been called.
    pub fn is_bootstrapped(&self) -> bool {
        self.inner.bootstrapped.get()
    }

    /// A dispatch handle bound to this engine.
    pub fn dispatcher(&self) -> Dispatcher<T> {
        Dispatcher::new(self.inner.self_weak.clone() as Weak<dyn EngineHub<T>>)
    }

    /// Run all deferred work to completion.
    ///
    /// Drives the debounce scheduler until both lanes are idle; the
    /// single-threaded analog of letting the host event loop go quiet.
    pub fn settle(&self) {
        self.inner.scheduler.settle();
    }

    /// True when no deferred work is pending.
    pub fn is_idle(&self) -> bool {
        self.inner.scheduler.is_idle()
    }

    /// The features announced so far, in admission order.
    pub fn features(&self) -> Vec<Rc<Feature<T>>> {
        self.inner.features.borrow().clone()
    }
}

impl<T: 'static> Default for Engine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> Clone for Engine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> std::fmt::Debug for Engine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("bootstrapped", &self.inner.bootstrapped.get())
            .field("features", &self.inner.features.borrow().len())
            .finish()
    }
}

impl<T: 'static> EngineInner<T> {
    fn dispatch_ref(&self, action: &Action<T>) {
        tracing::trace!(action = action.name(), "dispatch");
        self.pipeline
            .run(action, |a| self.handle(a), &|a| self.dispatch_ref(a));
    }

    /// Terminal handler: the final stop of every dispatched action.
    fn handle(&self, action: &Action<T>) -> Result<(), EngineError> {
        match action {
            Action::AddFeatures(features) => {
                for feature in features {
                    self.admit(feature)?;
                }
                Ok(())
            }
            Action::FeaturesAdded(features) => {
                let mut registry = self.features.borrow_mut();
                for feature in features {
                    if !registry.iter().any(|f| Rc::ptr_eq(f, feature)) {
                        registry.push(feature.clone());
                    }
                }
                Ok(())
            }
            Action::ChangeOccurred(key) => {
                if !self.providers.borrow().contains(key) {
                    return Err(EngineError::MissingProvider(key.clone()));
                }
                self.changed_keys.borrow_mut().insert(key.clone());
                self.key_change.trigger();
                Ok(())
            }
            Action::EnqueueApply(items) => {
                for item in items {
                    self.enqueue(&item.feature, item.targets.iter().cloned());
                }
                Ok(())
            }
            Action::ClearCache(request) => {
                if let Some(fid) = request.feature.id() {
                    self.connections.clear(fid, &request.targets);
                }
                Ok(())
            }
            Action::Error(err) => {
                tracing::warn!(error = %err, "dispatch failed");
                Ok(())
            }
            // announcements with no engine-side state transition
            Action::PopulateFeatureTargets(_) | Action::ApplyTargetResults(_) | Action::Bootstrap(_) => {
                Ok(())
            }
        }
    }

    fn admit(&self, feature: &Rc<Feature<T>>) -> Result<(), EngineError> {
        if feature.id().is_some() {
            // an id from a different engine means the feature belongs there
            if !self.knows(feature) {
                return Err(EngineError::ForeignFeature);
            }
            tracing::debug!(kind = feature.kind(), "feature already admitted; skipping");
            return Ok(());
        }
        feature.validate()?;
        let id = FeatureId::new(self.next_id.get());
        self.next_id.set(self.next_id.get() + 1);
        feature.assign_id(id);
        tracing::debug!(%id, kind = feature.kind(), "feature admitted");
        self.added.borrow_mut().push(feature.clone());
        self.announce_added.trigger();
        Ok(())
    }

    /// Whether this engine has admitted `feature` (announced or pending).
    fn knows(&self, feature: &Rc<Feature<T>>) -> bool {
        self.features.borrow().iter().any(|f| Rc::ptr_eq(f, feature))
            || self.added.borrow().iter().any(|f| Rc::ptr_eq(f, feature))
    }

    fn enqueue(&self, feature: &Rc<Feature<T>>, targets: impl IntoIterator<Item = Rc<T>>) {
        let filters = self.filters();
        if !allowed(feature, &filters) {
            tracing::debug!(id = ?feature.id(), "feature filtered out of enqueue");
            return;
        }
        self.apply_queue.borrow_mut().merge(feature, targets);
        self.queue_flush.trigger();
    }

    fn filters(&self) -> Vec<FilterFn<T>> {
        self.helpers
            .borrow()
            .get(FILTER_KEY)
            .into_iter()
            .flatten()
            .filter_map(|helper| match helper {
                Helper::Filter(f) => Some(f.clone()),
                _ => None,
            })
            .collect()
    }

    fn sorters(&self) -> Vec<SorterFn<T>> {
        self.helpers
            .borrow()
            .get(SORTER_KEY)
            .into_iter()
            .flatten()
            .filter_map(|helper| match helper {
                Helper::Sorter(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn flush_bootstrap(&self) {
        let Some(target) = self.pending_bootstrap.borrow_mut().take() else {
            return;
        };
        let registrar = Registrar::new(self.self_weak.clone() as Weak<dyn EngineHub<T>>);
        self.dispatch_ref(&Action::Bootstrap(BootstrapContext::new(target, registrar)));
    }

    fn flush_added(&self) {
        let batch = std::mem::take(&mut *self.added.borrow_mut());
        if batch.is_empty() {
            return;
        }
        self.dispatch_ref(&Action::FeaturesAdded(batch));
    }

    fn flush_key_changes(&self) {
        let keys = std::mem::take(&mut *self.changed_keys.borrow_mut());
        if keys.is_empty() {
            return;
        }

        let request = TargetRequest::new();
        {
            let index = self.key_index.borrow();
            for key in &keys {
                for feature in index.features_for(key) {
                    request.ensure(feature);
                }
            }
        }
        if request.is_empty() {
            tracing::trace!(keys = keys.len(), "no features depend on the changed keys");
        }
        // dispatched even when empty so observers see every change cycle
        self.dispatch_ref(&Action::PopulateFeatureTargets(request.clone()));

        let mut entries = request.take();
        sort_pending(&mut entries, &self.sorters());

        let items: Vec<_> = entries
            .into_iter()
            .filter(|(_, targets)| !targets.is_empty())
            .map(|(feature, targets)| crate::action::EnqueueItem {
                feature,
                targets: targets.into_iter().collect(),
            })
            .collect();
        if !items.is_empty() {
            self.dispatch_ref(&Action::EnqueueApply(items));
        }
    }

    fn flush_apply_queue(&self) {
        let mut entries = self.apply_queue.borrow_mut().drain();
        if entries.is_empty() {
            return;
        }
        sort_pending(&mut entries, &self.sorters());

        let mut builder = ResultBuilder::new();
        for (feature, targets) in &entries {
            let Some(fid) = feature.id() else {
                tracing::warn!(kind = feature.kind(), "skipping unadmitted feature in apply queue");
                continue;
            };
            for target in targets.iter() {
                // per-invocation snapshot: providers registered by user
                // code mid-flush take effect from the next pair onward
                let providers = self.providers.borrow().snapshot();
                let (invocation, reads) =
                    self.connections.invoke(fid, feature, target, &providers);
                if !reads.is_empty() {
                    self.key_index.borrow_mut().record(feature, reads);
                }
                builder.push(feature.kind(), target, invocation);
            }
        }

        if let Some(results) = builder.finish() {
            self.dispatch_ref(&Action::ApplyTargetResults(Rc::new(results)));
        }
    }
}

impl<T: 'static> EngineHub<T> for EngineInner<T> {
    fn dispatch_action(&self, action: &Action<T>) {
        self.dispatch_ref(action);
    }

    fn set_provider(&self, key: String, provider: ProviderFn<T>) {
        tracing::debug!(%key, "provider registered");
        self.providers.borrow_mut().set(key, provider);
    }

    fn remove_provider(&self, key: &str) {
        tracing::debug!(%key, "provider removed");
        self.providers.borrow_mut().remove(key);
    }
}
