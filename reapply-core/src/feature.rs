//! Features: the registered units of reactive behavior
//!
//! A [`Feature`] pairs a `kind` (grouping tag for result aggregation), a
//! list of `target_keys` (argument-provider key names whose target-producing
//! logic is relevant), named argument selectors, and an `apply` function.
//! Features are built through [`FeatureBuilder`], validated at
//! [`FeatureBuilder::build`], and immutable afterwards except for the id
//! the registry assigns at admission.
//!
//! Selectors read their inputs through an [`ArgBag`], a read-barrier facade
//! over the raw argument map: on a feature's first evaluation for a target
//! the bag records every key the selectors touch, which is how the engine
//! learns which provider keys a feature depends on without being told.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Process-unique feature identity, assigned in registration order.
///
/// The id doubles as the default sort key, so evaluation order falls back
/// to insertion order when no sorter helper breaks the tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureId(u64);

impl FeatureId {
    /// The raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of a feature's selector outputs, passed to `apply`.
pub type ArgValues = BTreeMap<String, Value>;

/// Computes a raw value for a target; registered per key via the
/// bootstrap registrar.
pub type ProviderFn<T> = Rc<dyn Fn(&T) -> Value>;

/// Derives one named argument from the raw argument bag.
pub type SelectorFn<T> = Rc<dyn Fn(&ArgBag<T>) -> Value>;

/// Produces the feature's result from a snapshot of its argument values.
pub type ApplyFn = Rc<dyn Fn(&ArgValues) -> Value>;

pub(crate) type ReadLog = Rc<RefCell<BTreeSet<String>>>;

/// The raw argument bag handed to selectors.
///
/// Holds the target plus one entry per registered argument provider. While
/// dependency discovery is active (the first evaluation per feature/target
/// pair) every read is recorded; afterwards the same accessors run without
/// tracking overhead.
pub struct ArgBag<T: 'static> {
    target: Rc<T>,
    values: Rc<BTreeMap<String, Value>>,
    log: Option<ReadLog>,
}

impl<T: 'static> ArgBag<T> {
    pub(crate) fn new(target: Rc<T>, values: Rc<BTreeMap<String, Value>>) -> Self {
        Self {
            target,
            values,
            log: None,
        }
    }

    pub(crate) fn tracked(target: Rc<T>, values: Rc<BTreeMap<String, Value>>, log: ReadLog) -> Self {
        Self {
            target,
            values,
            log: Some(log),
        }
    }

    /// The target this evaluation is for.
    ///
    /// Counts as a read of the `target` key for dependency discovery.
    pub fn target(&self) -> &Rc<T> {
        self.record("target");
        &self.target
    }

    /// Look up a provider value by key, recording the read.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.record(key);
        self.values.get(key)
    }

    /// Like [`get`](Self::get) but clones, yielding `Null` for absent keys.
    pub fn value(&self, key: &str) -> Value {
        self.get(key).cloned().unwrap_or(Value::Null)
    }

    /// Whether a provider value exists for `key`; counts as a read.
    pub fn contains(&self, key: &str) -> bool {
        self.record(key);
        self.values.contains_key(key)
    }

    /// The provider keys present in the bag. Enumerating keys is not a
    /// value read and is never recorded.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    fn record(&self, key: &str) {
        if let Some(log) = &self.log {
            log.borrow_mut().insert(key.to_string());
        }
    }
}

impl<T: 'static> fmt::Debug for ArgBag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgBag")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .field("tracked", &self.log.is_some())
            .finish()
    }
}

/// A registered unit of reactive behavior.
///
/// Created once via [`Feature::builder`] and shared as `Rc<Feature<T>>`;
/// identity is the shared allocation (and, once admitted, the assigned
/// [`FeatureId`]). A feature belongs to exactly one engine: adding it to a
/// second engine is rejected. Features live for the engine's lifetime;
/// there is no unregister path.
pub struct Feature<T: 'static> {
    id: Cell<Option<FeatureId>>,
    kind: String,
    target_keys: Vec<String>,
    args: Vec<(String, SelectorFn<T>)>,
    apply: ApplyFn,
}

impl<T: 'static> Feature<T> {
    /// Start building a feature of the given kind.
    pub fn builder(kind: impl Into<String>) -> FeatureBuilder<T> {
        FeatureBuilder {
            kind: kind.into(),
            target_keys: Vec::new(),
            args: Vec::new(),
            apply: None,
        }
    }

    /// The id assigned at admission, or `None` before the feature has been
    /// accepted by an engine.
    pub fn id(&self) -> Option<FeatureId> {
        self.id.get()
    }

    /// Grouping tag for result aggregation.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The provider key names whose target-producing logic is relevant to
    /// this feature.
    pub fn target_keys(&self) -> &[String] {
        &self.target_keys
    }

    /// Names of the declared argument selectors, in declaration order.
    pub fn arg_names(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|(name, _)| name.as_str())
    }

    pub(crate) fn args(&self) -> &[(String, SelectorFn<T>)] {
        &self.args
    }

    pub(crate) fn apply_fn(&self) -> &ApplyFn {
        &self.apply
    }

    pub(crate) fn assign_id(&self, id: FeatureId) {
        self.id.set(Some(id));
    }

    /// Sort key: assigned id, or last place for never-admitted features.
    pub(crate) fn sort_key(&self) -> u64 {
        self.id.get().map_or(u64::MAX, FeatureId::get)
    }

    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        validate_shape(&self.kind, &self.target_keys)
    }
}

impl<T: 'static> fmt::Debug for Feature<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("id", &self.id.get())
            .field("kind", &self.kind)
            .field("target_keys", &self.target_keys)
            .field("args", &self.args.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

fn is_non_empty(s: &str) -> bool {
    !s.trim().is_empty()
}

fn validate_shape(kind: &str, target_keys: &[String]) -> Result<(), EngineError> {
    if !is_non_empty(kind) {
        return Err(EngineError::EmptyKind);
    }
    if target_keys.is_empty() || !target_keys.iter().all(|k| is_non_empty(k)) {
        return Err(EngineError::InvalidTargetKeys);
    }
    Ok(())
}

/// Builder for [`Feature`].
///
/// ```
/// use reapply_core::feature::Feature;
/// use serde_json::json;
///
/// let feature = Feature::<()>::builder("style")
///     .target_key("node")
///     .arg("width", |bag| bag.value("dims"))
///     .apply(|args| json!({ "w": args["width"] }))
///     .build()
///     .unwrap();
/// assert_eq!(feature.kind(), "style");
/// ```
pub struct FeatureBuilder<T: 'static> {
    kind: String,
    target_keys: Vec<String>,
    args: Vec<(String, SelectorFn<T>)>,
    apply: Option<ApplyFn>,
}

impl<T: 'static> FeatureBuilder<T> {
    /// Declare one relevant provider-key name.
    pub fn target_key(mut self, key: impl Into<String>) -> Self {
        self.target_keys.push(key.into());
        self
    }

    /// Declare several relevant provider-key names.
    pub fn target_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Declare a named argument selector. Later declarations under the
    /// same name shadow earlier ones at evaluation time; declaration
    /// order is preserved for evaluation.
    pub fn arg(mut self, name: impl Into<String>, selector: impl Fn(&ArgBag<T>) -> Value + 'static) -> Self {
        self.args.push((name.into(), Rc::new(selector)));
        self
    }

    /// Set the apply function.
    pub fn apply(mut self, apply: impl Fn(&ArgValues) -> Value + 'static) -> Self {
        self.apply = Some(Rc::new(apply));
        self
    }

    /// Validate and build the feature.
    ///
    /// Fails if the kind is empty, the target-key list is empty or holds
    /// an empty entry, or no apply function was supplied.
    pub fn build(self) -> Result<Feature<T>, EngineError> {
        validate_shape(&self.kind, &self.target_keys)?;
        let apply = self.apply.ok_or(EngineError::MissingApply)?;
        Ok(Feature {
            id: Cell::new(None),
            kind: self.kind,
            target_keys: self.target_keys,
            args: self.args,
            apply,
        })
    }
}
