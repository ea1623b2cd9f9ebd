//! Cancellation plumbing.
//!
//! A `SignalHandler` watches a single signal source (usually ctrl-c) and
//! alerts every subscriber when it fires. Subscribers hold a guard while
//! they clean up; the handler is not "done" until every guard drops, which
//! keeps the process alive long enough for graceful child shutdown.

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<Mutex<HandlerState>>,
    close: mpsc::Sender<()>,
}

#[derive(Debug, Default)]
struct HandlerState {
    subscribers: Vec<oneshot::Sender<oneshot::Sender<()>>>,
    is_closing: bool,
}

pub struct SignalSubscriber(oneshot::Receiver<oneshot::Sender<()>>);

/// Held by a subscriber while it processes the signal.
pub struct SubscriberGuard(#[allow(dead_code)] oneshot::Sender<()>);

impl SignalHandler {
    /// Alerts subscribers when `signal_source` completes or `close` is
    /// called, whichever comes first.
    pub fn new(signal_source: impl Future<Output = Option<()>> + Send + 'static) -> Self {
        let state = Arc::new(Mutex::new(HandlerState::default()));
        let worker_state = state.clone();
        let (close, mut close_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            tokio::select! {
                // either path starts the shutdown; failure to receive
                // signals at all also does
                _ = signal_source => {},
                _ = close_rx.recv() => {}
            }

            let mut callbacks = {
                let mut state = worker_state.lock().expect("signal handler lock poisoned");
                state.is_closing = true;
                state
                    .subscribers
                    .drain(..)
                    .filter_map(|subscriber| {
                        let (tx, rx) = oneshot::channel();
                        // a vanished subscriber has nothing to clean up
                        subscriber.send(tx).ok()?;
                        Some(rx)
                    })
                    .collect::<FuturesUnordered<_>>()
            };

            // wait for each guard to drop (or be ignored)
            while callbacks.next().await.is_some() {}
        });

        Self { state, close }
    }

    /// Builds a handler wired to ctrl-c.
    pub fn for_ctrl_c() -> Self {
        Self::new(async { tokio::signal::ctrl_c().await.ok() })
    }

    /// Registers a subscriber. `None` when the handler has already started
    /// shutting down.
    pub fn subscribe(&self) -> Option<SignalSubscriber> {
        self.state
            .lock()
            .expect("signal handler lock poisoned")
            .add_subscriber()
            .map(SignalSubscriber)
    }

    /// Starts the shutdown without an external signal.
    pub async fn close(&self) {
        if self.close.send(()).await.is_err() {
            // worker already gone
            return;
        }
        self.done().await;
    }

    /// Waits until the handler has fired and every subscriber finished.
    pub async fn done(&self) {
        self.close.closed().await;
    }
}

impl SignalSubscriber {
    /// Resolves when the signal fires. The returned guard must be held
    /// until cleanup is complete.
    pub async fn listen(self) -> SubscriberGuard {
        let callback = self
            .0
            .await
            .expect("signal handler exited without alerting subscribers");
        SubscriberGuard(callback)
    }
}

impl HandlerState {
    fn add_subscriber(&mut self) -> Option<oneshot::Receiver<oneshot::Sender<()>>> {
        (!self.is_closing).then(|| {
            let (tx, rx) = oneshot::channel();
            self.subscribers.push(tx);
            rx
        })
    }
}
