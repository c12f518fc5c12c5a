//! Actions: the engine's internal command vocabulary
//!
//! Every state mutation in the engine travels through the dispatch bus as
//! an [`Action`]. External code normally only dispatches
//! [`Action::ChangeOccurred`]; the remaining variants are emitted by the
//! engine itself during its debounced flush cycles, and are visible to
//! middleware so behavior can be observed or extended at the bus.
//!
//! Wire names (for logging and middleware matching) follow the
//! `core:`-prefixed convention, e.g. `core:change-occurred`; the
//! catch-all failure action is plain `error`.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::Value;

use crate::dispatch::EngineHub;
use crate::error::EngineError;
use crate::feature::{Feature, ProviderFn};
use crate::queue::{ResultSet, TargetSet};

/// A command on the engine's dispatch bus.
pub enum Action<T: 'static> {
    /// Admit features into the registry (assigns ids).
    AddFeatures(Vec<Rc<Feature<T>>>),
    /// Debounced announcement of all features admitted this turn.
    FeaturesAdded(Vec<Rc<Feature<T>>>),
    /// External notification that the named provider key's value may have
    /// changed. The only action external callers routinely dispatch.
    ChangeOccurred(String),
    /// Request targets for the features a changed key affects. Middleware
    /// fills in the carried [`TargetRequest`].
    PopulateFeatureTargets(TargetRequest<T>),
    /// Queue (feature, targets) work for the next apply flush.
    EnqueueApply(Vec<EnqueueItem<T>>),
    /// Invalidate cached invocation state for specific pairs.
    ClearCache(ClearCacheRequest<T>),
    /// Announce the pruned results of an apply flush.
    ApplyTargetResults(Rc<ResultSet<T>>),
    /// One-time startup announcement carrying the root target and the
    /// provider registrar.
    Bootstrap(BootstrapContext<T>),
    /// A dispatch failed; carries the failure for observers.
    Error(EngineError),
}

impl<T: 'static> Action<T> {
    /// The action's wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Action::AddFeatures(_) => "core:add-features",
            Action::FeaturesAdded(_) => "core:features-added",
            Action::ChangeOccurred(_) => "core:change-occurred",
            Action::PopulateFeatureTargets(_) => "core:populate-feature-targets",
            Action::EnqueueApply(_) => "core:enqueue-apply",
            Action::ClearCache(_) => "core:clear-cache",
            Action::ApplyTargetResults(_) => "core:apply-target-results",
            Action::Bootstrap(_) => "core:bootstrap",
            Action::Error(_) => "error",
        }
    }

    /// A serializable digest of the action, for structured logging.
    pub fn summary(&self) -> ActionSummary {
        let mut summary = ActionSummary {
            name: self.name(),
            key: None,
            feature_ids: Vec::new(),
            count: None,
            error: None,
        };
        match self {
            Action::AddFeatures(features) | Action::FeaturesAdded(features) => {
                summary.feature_ids = features.iter().filter_map(|f| f.id().map(|id| id.get())).collect();
                summary.count = Some(features.len());
            }
            Action::ChangeOccurred(key) => summary.key = Some(key.clone()),
            Action::PopulateFeatureTargets(request) => {
                summary.count = Some(request.len());
            }
            Action::EnqueueApply(items) => {
                summary.feature_ids = items.iter().filter_map(|i| i.feature.id().map(|id| id.get())).collect();
                summary.count = Some(items.len());
            }
            Action::ClearCache(request) => {
                summary.feature_ids = request.feature.id().map(|id| id.get()).into_iter().collect();
                summary.count = Some(request.targets.len());
            }
            Action::ApplyTargetResults(results) => summary.count = Some(results.len()),
            Action::Bootstrap(_) => {}
            Action::Error(err) => summary.error = Some(err.to_string()),
        }
        summary
    }
}

impl<T: 'static> Clone for Action<T> {
    fn clone(&self) -> Self {
        match self {
            Action::AddFeatures(f) => Action::AddFeatures(f.clone()),
            Action::FeaturesAdded(f) => Action::FeaturesAdded(f.clone()),
            Action::ChangeOccurred(k) => Action::ChangeOccurred(k.clone()),
            Action::PopulateFeatureTargets(r) => Action::PopulateFeatureTargets(r.clone()),
            Action::EnqueueApply(i) => Action::EnqueueApply(i.clone()),
            Action::ClearCache(r) => Action::ClearCache(r.clone()),
            Action::ApplyTargetResults(r) => Action::ApplyTargetResults(r.clone()),
            Action::Bootstrap(c) => Action::Bootstrap(c.clone()),
            Action::Error(e) => Action::Error(e.clone()),
        }
    }
}

impl<T: 'static> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Error(err) => f.debug_tuple("Action").field(&self.name()).field(err).finish(),
            Action::ChangeOccurred(key) => {
                f.debug_tuple("Action").field(&self.name()).field(key).finish()
            }
            _ => f.debug_tuple("Action").field(&self.name()).finish(),
        }
    }
}

/// Flat, serializable digest of an [`Action`] for logging middleware.
#[derive(Debug, Clone, Serialize)]
pub struct ActionSummary {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub feature_ids: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The shared, fill-in-place payload of `core:populate-feature-targets`.
///
/// The engine seeds one empty slot per affected feature; middleware along
/// the bus (including the built-in terminal handler) add targets via
/// [`add_target`](TargetRequest::add_target). Clones share the same
/// underlying slots, so additions made by any middleware are visible to
/// the engine when the walk completes.
pub struct TargetRequest<T: 'static> {
    slots: Rc<RefCell<Vec<(Rc<Feature<T>>, TargetSet<T>)>>>,
}

impl<T: 'static> TargetRequest<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// The affected features, in admission order.
    pub fn features(&self) -> Vec<Rc<Feature<T>>> {
        self.slots.borrow().iter().map(|(f, _)| f.clone()).collect()
    }

    /// Add a target for `feature`; returns false if the target was already
    /// present or the feature is not part of this request.
    pub fn add_target(&self, feature: &Feature<T>, target: Rc<T>) -> bool {
        let mut slots = self.slots.borrow_mut();
        match slots
            .iter_mut()
            .find(|(f, _)| std::ptr::eq(Rc::as_ptr(f), feature as *const _))
        {
            Some((_, set)) => set.insert(target),
            None => false,
        }
    }

    /// Seed an empty slot for `feature` if none exists yet.
    pub(crate) fn ensure(&self, feature: &Rc<Feature<T>>) {
        let mut slots = self.slots.borrow_mut();
        if !slots.iter().any(|(f, _)| Rc::ptr_eq(f, feature)) {
            slots.push((feature.clone(), TargetSet::new()));
        }
    }

    pub(crate) fn take(&self) -> Vec<(Rc<Feature<T>>, TargetSet<T>)> {
        std::mem::take(&mut *self.slots.borrow_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }
}

impl<T: 'static> Clone for TargetRequest<T> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for TargetRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetRequest")
            .field("features", &self.len())
            .finish()
    }
}

/// One (feature, targets) pairing inside `core:enqueue-apply`.
pub struct EnqueueItem<T: 'static> {
    pub feature: Rc<Feature<T>>,
    pub targets: Vec<Rc<T>>,
}

impl<T: 'static> Clone for EnqueueItem<T> {
    fn clone(&self) -> Self {
        Self {
            feature: self.feature.clone(),
            targets: self.targets.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for EnqueueItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueItem")
            .field("feature", &self.feature.id())
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Payload of `core:clear-cache`.
pub struct ClearCacheRequest<T: 'static> {
    pub feature: Rc<Feature<T>>,
    pub targets: Vec<Rc<T>>,
}

impl<T: 'static> Clone for ClearCacheRequest<T> {
    fn clone(&self) -> Self {
        Self {
            feature: self.feature.clone(),
            targets: self.targets.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for ClearCacheRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClearCacheRequest")
            .field("feature", &self.feature.id())
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Payload of `core:bootstrap`: the root target plus the registrar used to
/// install argument providers.
pub struct BootstrapContext<T: 'static> {
    target: Rc<T>,
    registrar: Registrar<T>,
}

impl<T: 'static> BootstrapContext<T> {
    pub(crate) fn new(target: Rc<T>, registrar: Registrar<T>) -> Self {
        Self { target, registrar }
    }

    /// The target passed to `Engine::bootstrap`.
    pub fn target(&self) -> &Rc<T> {
        &self.target
    }

    /// The provider registrar.
    pub fn registrar(&self) -> &Registrar<T> {
        &self.registrar
    }

    /// Shorthand for `registrar().register(..)`.
    pub fn register(
        &self,
        key: impl Into<String>,
        provider: impl Fn(&T) -> Value + 'static,
    ) -> ProviderHandle<T> {
        self.registrar.register(key, provider)
    }
}

impl<T: 'static> Clone for BootstrapContext<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            registrar: self.registrar.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for BootstrapContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BootstrapContext")
    }
}

/// Installs argument providers into the engine that issued it.
///
/// Holds the engine weakly; registering against a dropped engine is a
/// silent no-op.
pub struct Registrar<T: 'static> {
    hub: Weak<dyn EngineHub<T>>,
}

impl<T: 'static> Registrar<T> {
    pub(crate) fn new(hub: Weak<dyn EngineHub<T>>) -> Self {
        Self { hub }
    }

    /// Register (or replace) the provider for `key`.
    ///
    /// The returned handle unregisters the key when consumed; dropping the
    /// handle without calling [`ProviderHandle::unregister`] leaves the
    /// provider installed for the engine's lifetime.
    pub fn register(
        &self,
        key: impl Into<String>,
        provider: impl Fn(&T) -> Value + 'static,
    ) -> ProviderHandle<T> {
        let key = key.into();
        if let Some(hub) = self.hub.upgrade() {
            hub.set_provider(key.clone(), Rc::new(provider) as ProviderFn<T>);
        }
        ProviderHandle {
            hub: self.hub.clone(),
            key,
        }
    }
}

impl<T: 'static> Clone for Registrar<T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Registrar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Registrar")
    }
}

/// Undo token for a provider registration.
#[derive(Debug)]
pub struct ProviderHandle<T: 'static> {
    hub: Weak<dyn EngineHub<T>>,
    key: String,
}

impl<T: 'static> ProviderHandle<T> {
    /// The provider key this handle controls.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the provider registration.
    pub fn unregister(self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_provider(&self.key);
        }
    }
}
