//! Queueing, filtering and ordering
//!
//! Holding pens and shaping logic between "something changed" and "apply
//! ran": the insertion-ordered identity [`TargetSet`], the merging
//! [`ApplyQueue`], configured [`Helper`] functions (filters gate enqueue,
//! sorters layer a comparator chain over insertion order), and the
//! [`ResultBuilder`] that groups invocation outcomes by feature kind and
//! prunes targets nothing changed for.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::connection::Invocation;
use crate::feature::Feature;

/// Returns whether a feature is currently eligible for enqueueing.
pub type FilterFn<T> = Rc<dyn Fn(&Feature<T>) -> bool>;

/// Compares two features for evaluation order; `Ordering::Equal` defers to
/// the next sorter in the chain (and ultimately to insertion order).
pub type SorterFn<T> = Rc<dyn Fn(&Feature<T>, &Feature<T>) -> Ordering>;

/// A named helper registered through `config`.
///
/// The engine consumes `Filter` helpers under the `"filter"` key and
/// `Sorter` helpers under `"sorter"`; `Custom` helpers under any key are
/// carried for external middleware to consume.
pub enum Helper<T: 'static> {
    Filter(FilterFn<T>),
    Sorter(SorterFn<T>),
    Custom(Rc<dyn Any>),
}

impl<T: 'static> Helper<T> {
    /// Wrap a filter predicate.
    pub fn filter(f: impl Fn(&Feature<T>) -> bool + 'static) -> Self {
        Helper::Filter(Rc::new(f))
    }

    /// Wrap a sorter comparator.
    pub fn sorter(f: impl Fn(&Feature<T>, &Feature<T>) -> Ordering + 'static) -> Self {
        Helper::Sorter(Rc::new(f))
    }
}

impl<T: 'static> Clone for Helper<T> {
    fn clone(&self) -> Self {
        match self {
            Helper::Filter(f) => Helper::Filter(f.clone()),
            Helper::Sorter(s) => Helper::Sorter(s.clone()),
            Helper::Custom(c) => Helper::Custom(c.clone()),
        }
    }
}

impl<T: 'static> fmt::Debug for Helper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Helper::Filter(_) => f.write_str("Helper::Filter"),
            Helper::Sorter(_) => f.write_str("Helper::Sorter"),
            Helper::Custom(_) => f.write_str("Helper::Custom"),
        }
    }
}

/// Insertion-ordered set of targets with allocation identity.
///
/// Targets are opaque values compared by `Rc` pointer, never by content.
pub struct TargetSet<T: 'static> {
    items: Vec<Rc<T>>,
    seen: HashSet<usize>,
}

impl<T: 'static> TargetSet<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Insert a target; returns false if it was already present.
    pub fn insert(&mut self, target: Rc<T>) -> bool {
        if self.seen.insert(Rc::as_ptr(&target) as usize) {
            self.items.push(target);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, target: &Rc<T>) -> bool {
        self.seen.contains(&(Rc::as_ptr(target) as usize))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<T>> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: 'static> Default for TargetSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> IntoIterator for TargetSet<T> {
    type Item = Rc<T>;
    type IntoIter = std::vec::IntoIter<Rc<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<T: 'static> fmt::Debug for TargetSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetSet").field("len", &self.items.len()).finish()
    }
}

/// Pending (feature → target set) work, merged across enqueue calls.
///
/// A feature appears at most once per flush cycle; repeated enqueues union
/// their target sets into the existing entry.
pub(crate) struct ApplyQueue<T: 'static> {
    entries: Vec<(Rc<Feature<T>>, TargetSet<T>)>,
}

impl<T: 'static> ApplyQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn merge(&mut self, feature: &Rc<Feature<T>>, targets: impl IntoIterator<Item = Rc<T>>) {
        let index = match self.entries.iter().position(|(f, _)| Rc::ptr_eq(f, feature)) {
            Some(index) => index,
            None => {
                self.entries.push((feature.clone(), TargetSet::new()));
                self.entries.len() - 1
            }
        };
        let set = &mut self.entries[index].1;
        for target in targets {
            set.insert(target);
        }
    }

    /// Snapshot-and-clear: work enqueued while a flush runs accumulates
    /// into the next flush.
    pub fn drain(&mut self) -> Vec<(Rc<Feature<T>>, TargetSet<T>)> {
        std::mem::take(&mut self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// First non-equal result of the sorter chain, else `Equal`.
pub(crate) fn chain_compare<T: 'static>(
    a: &Feature<T>,
    b: &Feature<T>,
    sorters: &[SorterFn<T>],
) -> Ordering {
    for sorter in sorters {
        let ordering = sorter(a, b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Order pending entries deterministically: a stable pass by ascending id
/// (insertion order), then a stable pass over the layered sorter chain, so
/// user sorters act as overrides and ties always fall back to id order.
pub(crate) fn sort_pending<T: 'static>(
    entries: &mut [(Rc<Feature<T>>, TargetSet<T>)],
    sorters: &[SorterFn<T>],
) {
    entries.sort_by_key(|(feature, _)| feature.sort_key());
    if !sorters.is_empty() {
        entries.sort_by(|(a, _), (b, _)| chain_compare(a, b, sorters));
    }
}

/// Whether every registered filter admits the feature.
pub(crate) fn allowed<T: 'static>(feature: &Feature<T>, filters: &[FilterFn<T>]) -> bool {
    filters.iter().all(|filter| filter(feature))
}

/// Apply results for one flush, grouped by feature kind.
///
/// Only targets with at least one changed invocation survive pruning; a
/// kind with no surviving targets is absent entirely.
pub struct ResultSet<T: 'static> {
    groups: Vec<ResultGroup<T>>,
}

/// The per-target result arrays for one feature kind.
pub struct ResultGroup<T: 'static> {
    kind: String,
    entries: Vec<(Rc<T>, Vec<Value>)>,
}

impl<T: 'static> ResultSet<T> {
    /// The kinds present, in first-encounter order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.kind.as_str())
    }

    pub fn group(&self, kind: &str) -> Option<&ResultGroup<T>> {
        self.groups.iter().find(|g| g.kind == kind)
    }

    pub fn groups(&self) -> &[ResultGroup<T>] {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl<T: 'static> ResultGroup<T> {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Result values for one target, in feature evaluation order.
    pub fn values_for(&self, target: &Rc<T>) -> Option<&[Value]> {
        self.entries
            .iter()
            .find(|(t, _)| Rc::ptr_eq(t, target))
            .map(|(_, values)| values.as_slice())
    }

    pub fn targets(&self) -> impl Iterator<Item = &Rc<T>> {
        self.entries.iter().map(|(t, _)| t)
    }

    pub fn entries(&self) -> &[(Rc<T>, Vec<Value>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: 'static> Clone for ResultSet<T> {
    fn clone(&self) -> Self {
        Self {
            groups: self.groups.clone(),
        }
    }
}

impl<T: 'static> Clone for ResultGroup<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            entries: self.entries.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for ResultSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.groups.iter().map(|g| (&g.kind, g.entries.len())))
            .finish()
    }
}

impl<T: 'static> fmt::Debug for ResultGroup<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultGroup")
            .field("kind", &self.kind)
            .field("targets", &self.entries.len())
            .finish()
    }
}

/// Accumulates invocation outcomes during a flush, then prunes.
pub(crate) struct ResultBuilder<T: 'static> {
    groups: Vec<(String, Vec<(Rc<T>, Vec<Invocation>)>)>,
}

impl<T: 'static> ResultBuilder<T> {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
        }
    }

    pub fn push(&mut self, kind: &str, target: &Rc<T>, invocation: Invocation) {
        let index = match self.groups.iter().position(|(k, _)| k == kind) {
            Some(index) => index,
            None => {
                self.groups.push((kind.to_string(), Vec::new()));
                self.groups.len() - 1
            }
        };
        let group = &mut self.groups[index].1;
        match group.iter_mut().find(|(t, _)| Rc::ptr_eq(t, target)) {
            Some((_, invocations)) => invocations.push(invocation),
            None => group.push((target.clone(), vec![invocation])),
        }
    }

    /// Prune and finish. A target survives only if at least one feature
    /// touching it changed; an empty flush yields `None` so nothing is
    /// dispatched downstream.
    pub fn finish(self) -> Option<ResultSet<T>> {
        let mut groups = Vec::new();
        for (kind, entries) in self.groups {
            let surviving: Vec<(Rc<T>, Vec<Value>)> = entries
                .into_iter()
                .filter(|(_, invocations)| invocations.iter().any(|i| i.changed))
                .map(|(target, invocations)| {
                    (target, invocations.into_iter().map(|i| i.value).collect())
                })
                .collect();
            if !surviving.is_empty() {
                groups.push(ResultGroup {
                    kind,
                    entries: surviving,
                });
            }
        }
        if groups.is_empty() {
            None
        } else {
            Some(ResultSet { groups })
        }
    }
}
