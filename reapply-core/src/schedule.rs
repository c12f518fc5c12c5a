//! Debounced scheduling primitives
//!
//! The engine never yields control mid-computation; the only suspension
//! points are the deferred callbacks registered here. [`Scheduler`] models
//! the host task queue with two FIFO lanes, and [`Coalesced`] is the
//! one-shot trigger that collapses any number of synchronous calls within
//! a turn into a single deferred invocation.
//!
//! # Example
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use reapply_core::schedule::{Coalesced, Scheduler, Strategy};
//!
//! let scheduler = Rc::new(Scheduler::new());
//! let runs = Rc::new(Cell::new(0));
//! let counter = runs.clone();
//! let trigger = Coalesced::new(scheduler.clone(), Strategy::NextTurn, move || {
//!     counter.set(counter.get() + 1);
//! });
//!
//! trigger.trigger();
//! trigger.trigger();
//! trigger.trigger();
//! scheduler.settle();
//! assert_eq!(runs.get(), 1);
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Which lane a deferred callback lands in.
///
/// `NextTurn` is the microtask analog: it runs before any `NextTick` work.
/// `NextTick` is the timer/macrotask analog: the scheduler drains the turn
/// lane completely between every tick job, matching event-loop ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Run on the next turn, before any deferred tick work.
    #[default]
    NextTurn,
    /// Run on the next tick, after all pending turn work has drained.
    NextTick,
}

type Job = Box<dyn FnOnce()>;

/// Two-lane FIFO queue of deferred one-shot callbacks.
///
/// Single-threaded by design; jobs are executed by [`Scheduler::settle`]
/// (or step-wise via [`Scheduler::run_turn`]). Jobs may defer further jobs
/// while running; those land in the appropriate lane for a later pass.
#[derive(Default)]
pub struct Scheduler {
    turn: RefCell<VecDeque<Job>>,
    tick: RefCell<VecDeque<Job>>,
}

impl Scheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer a one-shot callback into the lane selected by `strategy`.
    pub fn defer(&self, strategy: Strategy, job: impl FnOnce() + 'static) {
        let lane = match strategy {
            Strategy::NextTurn => &self.turn,
            Strategy::NextTick => &self.tick,
        };
        lane.borrow_mut().push_back(Box::new(job));
    }

    /// True when both lanes are empty.
    pub fn is_idle(&self) -> bool {
        self.turn.borrow().is_empty() && self.tick.borrow().is_empty()
    }

    /// Drain the turn lane, including jobs deferred while draining.
    ///
    /// Returns the number of jobs run.
    pub fn run_turn(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.pop_turn() {
            job();
            ran += 1;
        }
        ran
    }

    /// Run everything to idle: drain the turn lane, then run one tick job,
    /// and repeat until both lanes are empty.
    pub fn settle(&self) {
        loop {
            self.run_turn();
            match self.pop_tick() {
                Some(job) => job(),
                None => break,
            }
        }
    }

    // Jobs are popped under a short borrow and run after it is released,
    // so a running job may freely defer more work.
    fn pop_turn(&self) -> Option<Job> {
        self.turn.borrow_mut().pop_front()
    }

    fn pop_tick(&self) -> Option<Job> {
        self.tick.borrow_mut().pop_front()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("turn_jobs", &self.turn.borrow().len())
            .field("tick_jobs", &self.tick.borrow().len())
            .finish()
    }
}

/// A coalescing trigger: any number of synchronous [`trigger`] calls while
/// armed produce exactly one deferred invocation of the callback, after
/// which the trigger disarms and can be armed again.
///
/// The trigger disarms *before* the callback runs, so calls made from
/// within the callback arm the next turn rather than being lost.
///
/// [`trigger`]: Coalesced::trigger
pub struct Coalesced {
    armed: Rc<Cell<bool>>,
    strategy: Strategy,
    scheduler: Rc<Scheduler>,
    callback: Rc<dyn Fn()>,
}

impl Coalesced {
    /// Wrap `callback` in a coalescing trigger on the given scheduler lane.
    pub fn new(scheduler: Rc<Scheduler>, strategy: Strategy, callback: impl Fn() + 'static) -> Self {
        Self {
            armed: Rc::new(Cell::new(false)),
            strategy,
            scheduler,
            callback: Rc::new(callback),
        }
    }

    /// Request a deferred invocation. No-op while already armed.
    pub fn trigger(&self) {
        if self.armed.get() {
            return;
        }
        self.armed.set(true);
        let armed = self.armed.clone();
        let callback = self.callback.clone();
        self.scheduler.defer(self.strategy, move || {
            armed.set(false);
            callback();
        });
    }

    /// Whether an invocation is currently pending.
    pub fn is_armed(&self) -> bool {
        self.armed.get()
    }
}

impl std::fmt::Debug for Coalesced {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalesced")
            .field("armed", &self.armed.get())
            .field("strategy", &self.strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_trigger(scheduler: &Rc<Scheduler>, strategy: Strategy) -> (Coalesced, Rc<Cell<usize>>) {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let trigger = Coalesced::new(scheduler.clone(), strategy, move || {
            counter.set(counter.get() + 1);
        });
        (trigger, runs)
    }

    #[test]
    fn test_coalesces_synchronous_triggers() {
        let scheduler = Rc::new(Scheduler::new());
        let (trigger, runs) = counting_trigger(&scheduler, Strategy::NextTurn);

        for _ in 0..10 {
            trigger.trigger();
        }
        assert!(trigger.is_armed());
        scheduler.settle();

        assert_eq!(runs.get(), 1);
        assert!(!trigger.is_armed());
    }

    #[test]
    fn test_rearms_after_flush() {
        let scheduler = Rc::new(Scheduler::new());
        let (trigger, runs) = counting_trigger(&scheduler, Strategy::NextTurn);

        trigger.trigger();
        scheduler.settle();
        trigger.trigger();
        trigger.trigger();
        scheduler.settle();

        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_turn_lane_runs_before_tick_lane() {
        let scheduler = Rc::new(Scheduler::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        scheduler.defer(Strategy::NextTick, move || log.borrow_mut().push("tick"));
        let log = order.clone();
        scheduler.defer(Strategy::NextTurn, move || log.borrow_mut().push("turn"));

        scheduler.settle();
        assert_eq!(*order.borrow(), vec!["turn", "tick"]);
    }

    #[test]
    fn test_turn_work_deferred_by_tick_runs_before_next_tick() {
        let scheduler = Rc::new(Scheduler::new());
        let order = Rc::new(RefCell::new(Vec::new()));

        let inner = scheduler.clone();
        let log = order.clone();
        scheduler.defer(Strategy::NextTick, move || {
            log.borrow_mut().push("tick-1");
            let log = log.clone();
            inner.defer(Strategy::NextTurn, move || log.borrow_mut().push("turn-late"));
        });
        let log = order.clone();
        scheduler.defer(Strategy::NextTick, move || log.borrow_mut().push("tick-2"));

        scheduler.settle();
        assert_eq!(*order.borrow(), vec!["tick-1", "turn-late", "tick-2"]);
    }

    #[test]
    fn test_trigger_during_callback_schedules_next_pass() {
        let scheduler = Rc::new(Scheduler::new());
        let runs = Rc::new(Cell::new(0));

        // The callback re-triggers itself once; the re-trigger must land
        // in a later pass instead of being swallowed.
        let trigger: Rc<RefCell<Option<Coalesced>>> = Rc::new(RefCell::new(None));
        let counter = runs.clone();
        let handle = trigger.clone();
        let coalesced = Coalesced::new(scheduler.clone(), Strategy::NextTurn, move || {
            counter.set(counter.get() + 1);
            if counter.get() == 1 {
                if let Some(t) = handle.borrow().as_ref() {
                    t.trigger();
                }
            }
        });
        *trigger.borrow_mut() = Some(coalesced);

        trigger.borrow().as_ref().unwrap().trigger();
        scheduler.settle();
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn test_is_idle() {
        let scheduler = Rc::new(Scheduler::new());
        assert!(scheduler.is_idle());
        scheduler.defer(Strategy::NextTurn, || {});
        assert!(!scheduler.is_idle());
        scheduler.settle();
        assert!(scheduler.is_idle());
    }
}
