//! The dispatch bus and its middleware pipeline
//!
//! Dispatch is synchronous and re-entrant: an action walks the installed
//! middleware in reverse installation order and ends at the engine's
//! terminal handler. Any middleware (or the terminal handler) returning an
//! error stops the walk and re-dispatches the failure as an `error`
//! action, so observers see failures through the same bus as everything
//! else.
//!
//! Middleware are installed as factories. A factory receives a
//! [`Dispatcher`] bound to the engine under construction and returns the
//! interceptor closure, which lets middleware dispatch follow-up actions
//! of their own (the built-in target population relies on this shape).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::action::Action;
use crate::error::EngineError;
use crate::feature::ProviderFn;

/// Engine capabilities exposed to weakly-held companions (dispatchers and
/// registrars) without reference cycles.
pub(crate) trait EngineHub<T: 'static> {
    fn dispatch_action(&self, action: &Action<T>);
    fn set_provider(&self, key: String, provider: ProviderFn<T>);
    fn remove_provider(&self, key: &str);
}

/// A handle for dispatching actions into an engine.
///
/// Holds the engine weakly; dispatching after the engine is dropped is a
/// silent no-op. Cheap to clone.
pub struct Dispatcher<T: 'static> {
    hub: Weak<dyn EngineHub<T>>,
}

impl<T: 'static> Dispatcher<T> {
    pub(crate) fn new(hub: Weak<dyn EngineHub<T>>) -> Self {
        Self { hub }
    }

    /// Dispatch an action through the full middleware pipeline.
    pub fn dispatch(&self, action: Action<T>) {
        if let Some(hub) = self.hub.upgrade() {
            hub.dispatch_action(&action);
        }
    }
}

impl<T: 'static> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
        }
    }
}

impl<T: 'static> std::fmt::Debug for Dispatcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Dispatcher")
    }
}

/// An installed interceptor. Returning `Err` halts the walk and funnels
/// the failure into an `error` action.
pub type MiddlewareFn<T> = Rc<dyn Fn(&Action<T>) -> Result<(), EngineError>>;

/// Builds an interceptor once the engine's dispatcher exists.
pub type MiddlewareFactory<T> = Box<dyn FnOnce(Dispatcher<T>) -> MiddlewareFn<T>>;

/// The ordered interceptor chain.
///
/// Installation appends; dispatch walks in reverse, so the most recently
/// installed middleware sees actions first.
pub(crate) struct Pipeline<T: 'static> {
    interceptors: RefCell<Vec<MiddlewareFn<T>>>,
}

impl<T: 'static> Pipeline<T> {
    pub fn new() -> Self {
        Self {
            interceptors: RefCell::new(Vec::new()),
        }
    }

    pub fn install(&self, interceptor: MiddlewareFn<T>) {
        self.interceptors.borrow_mut().push(interceptor);
    }

    /// Walk the chain for one action, ending at `terminal`.
    ///
    /// The chain is snapshotted up front, so installations made while the
    /// walk runs only affect later dispatches. On the first error the walk
    /// stops and `redispatch` is invoked with an `error` action; errors
    /// carried by an `error` action itself are not re-wrapped, which keeps
    /// a failing observer from looping forever.
    pub fn run(
        &self,
        action: &Action<T>,
        terminal: impl Fn(&Action<T>) -> Result<(), EngineError>,
        redispatch: &dyn Fn(&Action<T>),
    ) {
        let chain: Vec<MiddlewareFn<T>> = self.interceptors.borrow().clone();
        for interceptor in chain.iter().rev() {
            if let Err(err) = interceptor(action) {
                funnel(action, err, redispatch);
                return;
            }
        }
        if let Err(err) = terminal(action) {
            funnel(action, err, redispatch);
        }
    }
}

fn funnel<T: 'static>(action: &Action<T>, err: EngineError, redispatch: &dyn Fn(&Action<T>)) {
    if matches!(action, Action::Error(_)) {
        tracing::warn!(error = %err, "error while handling an error action; dropping");
        return;
    }
    redispatch(&Action::Error(err));
}

/// A ready-made middleware that logs every action's summary at debug
/// level via [`tracing`].
pub fn logging_middleware<T: 'static>() -> MiddlewareFactory<T> {
    Box::new(|_dispatcher| {
        Rc::new(|action: &Action<T>| {
            match serde_json::to_string(&action.summary()) {
                Ok(digest) => tracing::debug!(action = action.name(), %digest, "dispatch"),
                Err(_) => tracing::debug!(action = action.name(), "dispatch"),
            }
            Ok(())
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node;

    #[test]
    fn test_runs_in_reverse_installation_order() {
        let pipeline: Pipeline<Node> = Pipeline::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let log = order.clone();
        pipeline.install(Rc::new(move |_| {
            log.borrow_mut().push("first-installed");
            Ok(())
        }));
        let log = order.clone();
        pipeline.install(Rc::new(move |_| {
            log.borrow_mut().push("second-installed");
            Ok(())
        }));

        let log = order.clone();
        pipeline.run(
            &Action::ChangeOccurred("k".into()),
            move |_| {
                log.borrow_mut().push("terminal");
                Ok(())
            },
            &|_| {},
        );

        assert_eq!(
            *order.borrow(),
            vec!["second-installed", "first-installed", "terminal"]
        );
    }

    #[test]
    fn test_error_halts_walk_and_redispatches() {
        let pipeline: Pipeline<Node> = Pipeline::new();
        let reached = Rc::new(RefCell::new(Vec::new()));

        let log = reached.clone();
        pipeline.install(Rc::new(move |_| {
            log.borrow_mut().push("inner");
            Ok(())
        }));
        pipeline.install(Rc::new(|_| Err(EngineError::middleware("boom"))));

        let errors = Rc::new(RefCell::new(Vec::new()));
        let seen = errors.clone();
        let log = reached.clone();
        pipeline.run(
            &Action::ChangeOccurred("k".into()),
            move |_| {
                log.borrow_mut().push("terminal");
                Ok(())
            },
            &move |action| {
                if let Action::Error(err) = action {
                    seen.borrow_mut().push(err.clone());
                }
            },
        );

        // neither the earlier middleware nor the terminal handler ran
        assert!(reached.borrow().is_empty());
        assert_eq!(*errors.borrow(), vec![EngineError::middleware("boom")]);
    }

    #[test]
    fn test_terminal_error_is_funneled() {
        let pipeline: Pipeline<Node> = Pipeline::new();
        let errors = Rc::new(RefCell::new(Vec::new()));
        let seen = errors.clone();

        pipeline.run(
            &Action::ChangeOccurred("k".into()),
            |_| Err(EngineError::MissingProvider("k".into())),
            &move |action| {
                if let Action::Error(err) = action {
                    seen.borrow_mut().push(err.clone());
                }
            },
        );

        assert_eq!(
            *errors.borrow(),
            vec![EngineError::MissingProvider("k".into())]
        );
    }

    #[test]
    fn test_failing_error_observer_does_not_loop() {
        let pipeline: Pipeline<Node> = Pipeline::new();
        pipeline.install(Rc::new(|action: &Action<Node>| {
            if matches!(action, Action::Error(_)) {
                Err(EngineError::middleware("observer failed"))
            } else {
                Ok(())
            }
        }));

        let redispatches = Rc::new(RefCell::new(0));
        let count = redispatches.clone();
        pipeline.run(
            &Action::Error(EngineError::EmptyKind),
            |_| Ok(()),
            &move |_| {
                *count.borrow_mut() += 1;
            },
        );

        assert_eq!(*redispatches.borrow(), 0);
    }

    #[test]
    fn test_installations_during_walk_apply_to_later_dispatches() {
        let pipeline: Rc<Pipeline<Node>> = Rc::new(Pipeline::new());
        let runs = Rc::new(RefCell::new(0));

        let inner = pipeline.clone();
        let count = runs.clone();
        pipeline.install(Rc::new(move |_| {
            let count = count.clone();
            inner.install(Rc::new(move |_| {
                *count.borrow_mut() += 1;
                Ok(())
            }));
            Ok(())
        }));

        pipeline.run(&Action::ChangeOccurred("k".into()), |_| Ok(()), &|_| {});
        assert_eq!(*runs.borrow(), 0);
        pipeline.run(&Action::ChangeOccurred("k".into()), |_| Ok(()), &|_| {});
        assert_eq!(*runs.borrow(), 1);
    }
}
