//! Closable multicast stream.
//!
//! One producer, any number of [`Subscription`] consumers. Values are fanned
//! out to everyone subscribed at emission time; there is no replay. The first
//! terminal event (`error` or `complete`) sticks and everything after it is
//! dropped. When the live subscriber count falls back to zero the close
//! callback fires, exactly once, terminal or not. That callback is how
//! endpoints learn a channel has no consumers left and send `CLOSE`.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::RpcError;

type CloseFn = Box<dyn FnOnce() + Send>;

enum Terminal {
    Completed,
    Errored(RpcError),
}

struct Shared<T> {
    subscribers: Vec<(u64, mpsc::UnboundedSender<Result<T, RpcError>>)>,
    next_sub_id: u64,
    live_subs: usize,
    terminal: Option<Terminal>,
    on_close: Option<CloseFn>,
}

/// Handle to a multicast channel. Cloning shares the channel.
pub struct Multicast<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Multicast {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Multicast<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A channel whose `on_close` runs when the last subscriber detaches.
    pub fn with_close(on_close: impl FnOnce() + Send + 'static) -> Self {
        Self::build(Some(Box::new(on_close)))
    }

    fn build(on_close: Option<CloseFn>) -> Self {
        Multicast {
            shared: Arc::new(Mutex::new(Shared {
                subscribers: Vec::new(),
                next_sub_id: 0,
                live_subs: 0,
                terminal: None,
                on_close,
            })),
        }
    }

    /// Deliver a value to every current subscriber. Dropped after a terminal.
    pub fn next(&self, value: T) {
        let mut shared = self.shared.lock();
        if shared.terminal.is_some() {
            return;
        }
        shared
            .subscribers
            .retain(|(_, tx)| tx.send(Ok(value.clone())).is_ok());
    }

    /// Terminate with an error. First terminal wins.
    pub fn error(&self, err: RpcError) {
        let mut shared = self.shared.lock();
        if shared.terminal.is_some() {
            return;
        }
        for (_, tx) in shared.subscribers.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
        shared.terminal = Some(Terminal::Errored(err));
    }

    /// Terminate gracefully. First terminal wins.
    pub fn complete(&self) {
        let mut shared = self.shared.lock();
        if shared.terminal.is_some() {
            return;
        }
        // Dropping the senders ends every subscription stream.
        shared.subscribers.clear();
        shared.terminal = Some(Terminal::Completed);
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminal.is_some()
    }

    /// Attach a consumer.
    ///
    /// A subscriber arriving after a terminal sees no values: it gets the
    /// terminal error if the channel errored, or an immediate end if it
    /// completed.
    pub fn subscribe(&self) -> Subscription<T> {
        let mut shared = self.shared.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = shared.next_sub_id;
        shared.next_sub_id += 1;
        match &shared.terminal {
            None => shared.subscribers.push((id, tx)),
            Some(Terminal::Errored(err)) => {
                let _ = tx.send(Err(err.clone()));
            }
            Some(Terminal::Completed) => {}
        }
        shared.live_subs += 1;
        Subscription {
            rx,
            id,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Multicast<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One consumer of a [`Multicast`]. Dropping it detaches; the last detach
/// fires the channel's close callback.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Result<T, RpcError>>,
    id: u64,
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Stream for Subscription<T> {
    type Item = Result<T, RpcError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let close = {
            let mut shared = self.shared.lock();
            shared.subscribers.retain(|(id, _)| *id != self.id);
            shared.live_subs -= 1;
            if shared.live_subs == 0 {
                shared.on_close.take()
            } else {
                None
            }
        };
        // Runs without the lock held; the callback may re-enter endpoint
        // state.
        if let Some(close) = close {
            close();
        }
    }
}
