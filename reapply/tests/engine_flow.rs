//! End-to-end tests of the reactive apply cycle: a small host middleware
//! registers providers at bootstrap, enqueues announced features and
//! resolves targets, the way an embedding environment would.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use reapply::prelude::*;
use reapply::{FILTER_KEY, SORTER_KEY};
use serde_json::json;

struct Widget {
    width: Cell<i64>,
}

impl Widget {
    fn new(width: i64) -> Rc<Self> {
        Rc::new(Self {
            width: Cell::new(width),
        })
    }
}

#[derive(Default)]
struct HostState {
    targets: Vec<Rc<Widget>>,
}

/// The embedding side of the contract: provides the `dims` argument,
/// connects announced features to known targets, and answers target
/// population requests.
fn host_middleware(state: Rc<RefCell<HostState>>) -> MiddlewareFactory<Widget> {
    Box::new(move |dispatcher: Dispatcher<Widget>| {
        Rc::new(move |action: &Action<Widget>| {
            match action {
                Action::Bootstrap(context) => {
                    state.borrow_mut().targets.push(context.target().clone());
                    let _handle = context.register("dims", |w: &Widget| json!(w.width.get()));
                }
                Action::FeaturesAdded(features) => {
                    let targets = state.borrow().targets.clone();
                    if !targets.is_empty() {
                        let items = features
                            .iter()
                            .map(|feature| EnqueueItem {
                                feature: feature.clone(),
                                targets: targets.clone(),
                            })
                            .collect();
                        dispatcher.dispatch(Action::EnqueueApply(items));
                    }
                }
                Action::PopulateFeatureTargets(request) => {
                    for feature in request.features() {
                        for target in state.borrow().targets.iter() {
                            request.add_target(&feature, target.clone());
                        }
                    }
                }
                _ => {}
            }
            Ok(())
        })
    })
}

type ResultLog = Rc<RefCell<Vec<Rc<ResultSet<Widget>>>>>;
type ErrorLog = Rc<RefCell<Vec<EngineError>>>;

fn collecting_middleware(results: ResultLog, errors: ErrorLog) -> MiddlewareFactory<Widget> {
    Box::new(move |_| {
        Rc::new(move |action: &Action<Widget>| {
            match action {
                Action::ApplyTargetResults(set) => results.borrow_mut().push(set.clone()),
                Action::Error(err) => errors.borrow_mut().push(err.clone()),
                _ => {}
            }
            Ok(())
        })
    })
}

struct Harness {
    engine: Engine<Widget>,
    host: Rc<RefCell<HostState>>,
    results: ResultLog,
    errors: ErrorLog,
}

fn harness() -> Harness {
    let host = Rc::new(RefCell::new(HostState::default()));
    let results: ResultLog = Rc::new(RefCell::new(Vec::new()));
    let errors: ErrorLog = Rc::new(RefCell::new(Vec::new()));
    let engine = Engine::with_middleware(vec![
        host_middleware(host.clone()),
        collecting_middleware(results.clone(), errors.clone()),
    ]);
    Harness {
        engine,
        host,
        results,
        errors,
    }
}

fn width_feature(kind: &str, applied: Rc<Cell<usize>>) -> Rc<Feature<Widget>> {
    Rc::new(
        Feature::<Widget>::builder(kind)
            .target_key("dims")
            .arg("width", |bag| bag.value("dims"))
            .apply(move |args: &ArgValues| {
                applied.set(applied.get() + 1);
                json!(args["width"].as_i64().unwrap() * 2)
            })
            .build()
            .unwrap(),
    )
}

#[test]
fn test_change_notification_reapplies_only_on_changed_arguments() {
    let h = harness();
    let widget = Widget::new(123);
    let applied = Rc::new(Cell::new(0));

    h.engine.bootstrap(widget.clone()).unwrap();
    h.engine.add(width_feature("style", applied.clone())).unwrap();
    h.engine.settle();

    // initial connect applies once
    assert_eq!(applied.get(), 1);
    assert_eq!(h.results.borrow().len(), 1);
    let first = h.results.borrow()[0].clone();
    assert_eq!(
        first.group("style").unwrap().values_for(&widget).unwrap(),
        &[json!(246)]
    );

    // a real change recomputes
    widget.width.set(456);
    h.engine
        .dispatcher()
        .dispatch(Action::ChangeOccurred("dims".into()));
    h.engine.settle();
    assert_eq!(applied.get(), 2);
    assert_eq!(h.results.borrow().len(), 2);
    let second = h.results.borrow()[1].clone();
    assert_eq!(
        second.group("style").unwrap().values_for(&widget).unwrap(),
        &[json!(912)]
    );

    // a spurious notification replays the memo and prunes the result
    h.engine
        .dispatcher()
        .dispatch(Action::ChangeOccurred("dims".into()));
    h.engine.settle();
    assert_eq!(applied.get(), 2);
    assert_eq!(h.results.borrow().len(), 2);
    assert!(h.errors.borrow().is_empty());
}

#[test]
fn test_burst_of_change_notifications_coalesces_into_one_flush() {
    let h = harness();
    let widget = Widget::new(1);
    let applied = Rc::new(Cell::new(0));

    h.engine.bootstrap(widget.clone()).unwrap();
    h.engine.add(width_feature("style", applied.clone())).unwrap();
    h.engine.settle();
    assert_eq!(applied.get(), 1);

    widget.width.set(2);
    let dispatcher = h.engine.dispatcher();
    for _ in 0..5 {
        dispatcher.dispatch(Action::ChangeOccurred("dims".into()));
    }
    h.engine.settle();

    assert_eq!(applied.get(), 2);
    assert_eq!(h.results.borrow().len(), 2);
}

#[test]
fn test_filter_excludes_feature_from_apply() {
    let h = harness();
    let widget = Widget::new(7);
    let kept = Rc::new(Cell::new(0));
    let skipped = Rc::new(Cell::new(0));

    h.engine
        .config(FILTER_KEY, Helper::filter(|f| f.kind() != "skip"))
        .unwrap();
    h.engine.bootstrap(widget).unwrap();
    h.engine.add(width_feature("style", kept.clone())).unwrap();
    h.engine.add(width_feature("skip", skipped.clone())).unwrap();
    h.engine.settle();

    assert_eq!(kept.get(), 1);
    assert_eq!(skipped.get(), 0);
    let results = h.results.borrow();
    assert_eq!(results.len(), 1);
    assert!(results[0].group("style").is_some());
    assert!(results[0].group("skip").is_none());
}

#[test]
fn test_sorter_overrides_insertion_order() {
    let h = harness();
    let widget = Widget::new(1);
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let recording = |label: &'static str, log: Rc<RefCell<Vec<&'static str>>>| {
        Rc::new(
            Feature::<Widget>::builder(label)
                .target_key("dims")
                .apply(move |_: &ArgValues| {
                    log.borrow_mut().push(label);
                    Value::Null
                })
                .build()
                .unwrap(),
        )
    };

    h.engine
        .config(
            SORTER_KEY,
            Helper::sorter(|a, b| {
                // reverse admission order
                b.id().cmp(&a.id())
            }),
        )
        .unwrap();
    h.engine.bootstrap(widget).unwrap();
    h.engine.add(recording("first", order.clone())).unwrap();
    h.engine.add(recording("second", order.clone())).unwrap();
    h.engine.settle();

    assert_eq!(*order.borrow(), vec!["second", "first"]);
}

#[test]
fn test_result_pruning_drops_unchanged_targets() {
    let h = harness();
    let root = Widget::new(10);
    let sibling = Widget::new(20);
    h.host.borrow_mut().targets.push(sibling.clone());

    let applied = Rc::new(Cell::new(0));
    h.engine.bootstrap(root.clone()).unwrap();
    h.engine.add(width_feature("style", applied.clone())).unwrap();
    h.engine.settle();

    // initial connect covers both targets
    assert_eq!(applied.get(), 2);
    assert_eq!(h.results.borrow().len(), 1);
    assert_eq!(h.results.borrow()[0].group("style").unwrap().len(), 2);

    // only the root changes; the sibling is pruned from the result set
    root.width.set(11);
    h.engine
        .dispatcher()
        .dispatch(Action::ChangeOccurred("dims".into()));
    h.engine.settle();

    let results = h.results.borrow();
    assert_eq!(results.len(), 2);
    let group = results[1].group("style").unwrap();
    assert_eq!(group.values_for(&root).unwrap(), &[json!(22)]);
    assert!(group.values_for(&sibling).is_none());
}

#[test]
fn test_middleware_error_becomes_error_action_and_halts() {
    let host = Rc::new(RefCell::new(HostState::default()));
    let results: ResultLog = Rc::new(RefCell::new(Vec::new()));
    let errors: ErrorLog = Rc::new(RefCell::new(Vec::new()));
    let failing: MiddlewareFactory<Widget> = Box::new(|_| {
        Rc::new(|action: &Action<Widget>| {
            if matches!(action, Action::ChangeOccurred(_)) {
                Err(EngineError::middleware("rejected"))
            } else {
                Ok(())
            }
        })
    });
    let engine = Engine::with_middleware(vec![
        host_middleware(host),
        collecting_middleware(results.clone(), errors.clone()),
        failing,
    ]);

    let widget = Widget::new(1);
    let applied = Rc::new(Cell::new(0));
    engine.bootstrap(widget.clone()).unwrap();
    engine.add(width_feature("style", applied.clone())).unwrap();
    engine.settle();
    assert_eq!(applied.get(), 1);

    widget.width.set(2);
    engine
        .dispatcher()
        .dispatch(Action::ChangeOccurred("dims".into()));
    engine.settle();

    // the change never reached the engine, so nothing recomputed
    assert_eq!(applied.get(), 1);
    assert_eq!(*errors.borrow(), vec![EngineError::middleware("rejected")]);
}

#[test]
fn test_change_for_unregistered_key_reports_missing_provider() {
    let h = harness();
    h.engine.bootstrap(Widget::new(1)).unwrap();
    h.engine.settle();

    h.engine
        .dispatcher()
        .dispatch(Action::ChangeOccurred("ghost".into()));
    h.engine.settle();

    assert_eq!(
        *h.errors.borrow(),
        vec![EngineError::MissingProvider("ghost".into())]
    );
}

#[test]
fn test_features_added_after_bootstrap_connect_immediately() {
    let h = harness();
    let widget = Widget::new(5);
    let applied = Rc::new(Cell::new(0));

    h.engine.bootstrap(widget).unwrap();
    h.engine.settle();
    assert!(h.results.borrow().is_empty());

    h.engine.add(width_feature("late", applied.clone())).unwrap();
    h.engine.settle();

    assert_eq!(applied.get(), 1);
    assert_eq!(h.results.borrow().len(), 1);
}

#[tokio::test]
async fn test_runtime_drives_the_cycle_from_signals() {
    let h = harness();
    let widget = Widget::new(100);
    let applied = Rc::new(Cell::new(0));
    h.engine.bootstrap(widget.clone()).unwrap();
    h.engine.add(width_feature("style", applied.clone())).unwrap();

    let mut runtime = EngineRuntime::new(h.engine.clone());
    let tx = runtime.signal_tx();
    let cancel = runtime.cancel_token();

    widget.width.set(101);
    tx.send(EngineSignal::Changed("dims".into())).unwrap();
    tx.send(EngineSignal::Settle).unwrap();
    tokio::spawn(async move {
        cancel.cancel();
    });
    runtime.run().await;

    // initial connect plus the signalled change
    assert_eq!(applied.get(), 2);
    assert_eq!(h.results.borrow().len(), 2);
}
