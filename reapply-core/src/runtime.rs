//! Async driver for an engine
//!
//! [`Engine`] itself is single-threaded and synchronous; [`EngineRuntime`]
//! hosts one on a tokio task and feeds it from a channel of
//! [`EngineSignal`]s, settling all deferred engine work between signals.
//! The signal sender is `Send + Sync`, so any task or thread can notify
//! the engine of changes without touching the engine directly.
//!
//! Shutdown is cooperative through a [`CancellationToken`]; the loop
//! settles outstanding work one final time before returning.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::action::Action;
use crate::engine::Engine;

/// A cross-task notification for a hosted engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineSignal {
    /// A provider key's value may have changed; dispatched as
    /// `core:change-occurred`.
    Changed(String),
    /// Settle deferred work without dispatching anything.
    Settle,
}

/// Hosts an [`Engine`] on an async task.
pub struct EngineRuntime<T: 'static> {
    engine: Engine<T>,
    signal_tx: mpsc::UnboundedSender<EngineSignal>,
    signal_rx: mpsc::UnboundedReceiver<EngineSignal>,
    cancel: CancellationToken,
}

impl<T: 'static> EngineRuntime<T> {
    /// Wrap an engine for async hosting.
    pub fn new(engine: Engine<T>) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            signal_tx,
            signal_rx,
            cancel: CancellationToken::new(),
        }
    }

    /// A sender for feeding signals into the run loop.
    pub fn signal_tx(&self) -> mpsc::UnboundedSender<EngineSignal> {
        self.signal_tx.clone()
    }

    /// The token that stops [`run`](Self::run).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The hosted engine.
    pub fn engine(&self) -> &Engine<T> {
        &self.engine
    }

    /// Drive the engine until cancelled or all senders are dropped.
    ///
    /// Deferred engine work is settled before waiting for each signal, so
    /// the engine is quiescent whenever the loop is parked.
    pub async fn run(&mut self) {
        tracing::debug!("engine runtime started");
        loop {
            self.engine.settle();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("engine runtime cancelled");
                    break;
                }
                signal = self.signal_rx.recv() => match signal {
                    Some(EngineSignal::Changed(key)) => {
                        self.engine.dispatcher().dispatch(Action::ChangeOccurred(key));
                    }
                    Some(EngineSignal::Settle) => {}
                    None => {
                        tracing::debug!("all signal senders dropped");
                        break;
                    }
                },
            }
        }
        self.engine.settle();
    }
}

impl<T: 'static> std::fmt::Debug for EngineRuntime<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRuntime")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
