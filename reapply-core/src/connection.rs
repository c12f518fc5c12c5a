//! Change detection and memoized invocation ("Connection")
//!
//! [`Connections`] owns the per-(feature, target) cache. For each
//! invocation it rebuilds the raw argument bag from the registered
//! providers, runs the feature's declared selectors, diffs their outputs
//! against the last-seen values, and re-runs `apply` only when something
//! changed (or on the very first call for a pair). The first evaluation
//! per pair runs with dependency discovery enabled: every provider key a
//! selector reads is reported back so the engine can index which features
//! care about which keys.
//!
//! Cache entries hold the target behind a `Weak`, so a cached pair never
//! keeps an otherwise-unreferenced target alive; dead entries are pruned
//! on the next access to the owning feature's slot map. The only explicit
//! invalidation path is [`Connections::clear`], driven by the
//! `core:clear-cache` action.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use serde_json::Value;

use crate::feature::{ArgBag, Feature, FeatureId, ProviderFn, ReadLog};

/// Outcome of one memoized invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Whether `apply` ran (first call or an argument changed).
    pub changed: bool,
    /// The current result: freshly computed, or replayed from cache.
    pub value: Value,
}

/// Ordered registry of argument providers.
///
/// Registration order is preserved; re-registering a key replaces the
/// provider in place. Unregistering removes the mapping entirely: any
/// feature still depending on that key simply stops seeing a value, and a
/// later `core:change-occurred` for it fails loudly.
pub(crate) struct Providers<T: 'static> {
    entries: Vec<(String, ProviderFn<T>)>,
}

impl<T: 'static> Providers<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|(k, _)| k == key)
    }

    pub fn set(&mut self, key: String, provider: ProviderFn<T>) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = provider,
            None => self.entries.push((key, provider)),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    /// Cheap per-invocation snapshot (`Rc` clones only).
    pub fn snapshot(&self) -> Vec<(String, ProviderFn<T>)> {
        self.entries.clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Key → features index built from observed reads.
///
/// Populated incrementally from dependency-discovery passes; never
/// shrinks. Resolves "which features care about this changed key" without
/// callers declaring dependencies up front.
pub(crate) struct KeyIndex<T: 'static> {
    map: HashMap<String, Vec<Rc<Feature<T>>>>,
}

impl<T: 'static> KeyIndex<T> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Record that `feature` was observed reading each of `keys`.
    pub fn record(&mut self, feature: &Rc<Feature<T>>, keys: impl IntoIterator<Item = String>) {
        for key in keys {
            let readers = self.map.entry(key).or_default();
            if !readers.iter().any(|f| Rc::ptr_eq(f, feature)) {
                readers.push(feature.clone());
            }
        }
    }

    pub fn features_for(&self, key: &str) -> &[Rc<Feature<T>>] {
        self.map.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    pub fn key_count(&self) -> usize {
        self.map.len()
    }
}

/// Last-known state for one (feature, target) pair.
struct MetaData {
    logged: bool,
    value: Value,
    last_args: BTreeMap<String, Value>,
}

impl MetaData {
    fn fresh() -> Self {
        Self {
            logged: false,
            value: Value::Null,
            last_args: BTreeMap::new(),
        }
    }
}

struct TargetSlot<T> {
    target: Weak<T>,
    meta: MetaData,
}

/// The memoized-invocation engine.
///
/// Purely functional given its private cache: it never touches the
/// dispatch bus. Keyed first by feature id, then by target allocation.
pub(crate) struct Connections<T: 'static> {
    meta: RefCell<HashMap<FeatureId, HashMap<usize, TargetSlot<T>>>>,
}

impl<T: 'static> Connections<T> {
    pub fn new() -> Self {
        Self {
            meta: RefCell::new(HashMap::new()),
        }
    }

    /// Invoke (or replay) `feature` for `target`.
    ///
    /// Returns the invocation outcome plus the provider keys read during a
    /// dependency-discovery pass (empty once discovery has run for the
    /// pair, since the dependency set is assumed stable after first
    /// evaluation).
    pub fn invoke(
        &self,
        fid: FeatureId,
        feature: &Feature<T>,
        target: &Rc<T>,
        providers: &[(String, ProviderFn<T>)],
    ) -> (Invocation, Vec<String>) {
        let slot_key = Rc::as_ptr(target) as usize;

        // Take the entry out so no cache borrow is held while user code
        // (providers, selectors, apply) runs; user code may re-enter the
        // engine and land back here.
        let (existed, mut meta) = {
            let mut cache = self.meta.borrow_mut();
            let slots = cache.entry(fid).or_default();
            slots.retain(|_, slot| slot.target.strong_count() > 0);
            match slots.remove(&slot_key) {
                Some(slot) => (true, slot.meta),
                None => (false, MetaData::fresh()),
            }
        };

        let mut values = BTreeMap::new();
        for (key, provider) in providers {
            values.insert(key.clone(), provider(target));
        }
        let values = Rc::new(values);

        let log: ReadLog = Rc::new(RefCell::new(BTreeSet::new()));
        let bag = if meta.logged {
            ArgBag::new(target.clone(), values)
        } else {
            ArgBag::tracked(target.clone(), values, log.clone())
        };

        let mut changed = false;
        for (name, selector) in feature.args() {
            let result = selector(&bag);
            if meta.last_args.get(name) != Some(&result) {
                changed = true;
            }
            meta.last_args.insert(name.clone(), result);
        }

        if !existed || changed {
            let params = meta.last_args.clone();
            meta.value = (feature.apply_fn())(&params);
            meta.logged = true;
            changed = true;
        }

        let invocation = Invocation {
            changed,
            value: meta.value.clone(),
        };
        let reads: Vec<String> = log.borrow().iter().cloned().collect();

        self.meta
            .borrow_mut()
            .entry(fid)
            .or_default()
            .insert(slot_key, TargetSlot {
                target: Rc::downgrade(target),
                meta,
            });

        (invocation, reads)
    }

    /// Delete the cache entries for the named targets of one feature,
    /// forcing first-call behavior on their next invocation.
    pub fn clear(&self, fid: FeatureId, targets: &[Rc<T>]) {
        let mut cache = self.meta.borrow_mut();
        if let Some(slots) = cache.get_mut(&fid) {
            for target in targets {
                slots.remove(&(Rc::as_ptr(target) as usize));
            }
        }
    }

    #[cfg(test)]
    pub fn cached_targets(&self, fid: FeatureId) -> usize {
        self.meta
            .borrow()
            .get(&fid)
            .map(|slots| {
                slots
                    .values()
                    .filter(|slot| slot.target.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }
}
