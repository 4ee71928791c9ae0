//! Channel-backed listener endpoints.
//!
//! [`ChannelListener`] lives on the dispatcher's sequence and pushes
//! [`QuotaChangeEvent`]s into a tokio unbounded channel. The matching
//! [`ListenerReceiver`] is `Send` and may be moved to any thread or task.
//!
//! When the receiver goes away the listener posts its disconnect handler
//! through the [`TimerService`], so the dispatcher sees the disconnect as a
//! fresh task and never re-entrantly from inside `notify`. A plain
//! [`ChannelListener::channel`] notices on the next failed send; one created
//! with [`ChannelListener::watched`] also notices while idle.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::dispatcher::{DisconnectHandler, ListenerEndpoint, Origin};
use crate::sequence::{TimerId, TimerService};
use crate::tokio_driver::TokioSequence;

/// One quota change notification as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaChangeEvent {
    /// ASCII serialization of the origin the listener registered for.
    pub origin: String,
    /// Per-listener delivery counter, starting at 1.
    pub sequence: u64,
}

/// Sending half, registered with the dispatcher.
pub struct ChannelListener {
    origin: Origin,
    sender: mpsc::UnboundedSender<QuotaChangeEvent>,
    timers: Rc<dyn TimerService>,
    handler: RefCell<Option<DisconnectHandler>>,
    disconnected: Cell<bool>,
    sent: Cell<u64>,
    watcher: Cell<Option<TimerId>>,
}

impl std::fmt::Debug for ChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelListener")
            .field("origin", &self.origin)
            .field("disconnected", &self.disconnected.get())
            .field("sent", &self.sent.get())
            .finish()
    }
}

impl ChannelListener {
    /// Create a listener for `origin` and the receiver that drains it.
    #[must_use]
    pub fn channel(origin: Origin, timers: Rc<dyn TimerService>) -> (Rc<Self>, ListenerReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = Rc::new(Self {
            origin,
            sender,
            timers,
            handler: RefCell::new(None),
            disconnected: Cell::new(false),
            sent: Cell::new(0),
            watcher: Cell::new(None),
        });
        (listener, ListenerReceiver { receiver })
    }

    /// Like [`channel`](Self::channel), but a task on `driver` waits for the
    /// receiver to go away and disconnects without waiting for a send.
    ///
    /// Must be called inside the driver's `LocalSet`.
    #[must_use]
    pub fn watched(origin: Origin, driver: &TokioSequence) -> (Rc<Self>, ListenerReceiver) {
        let (listener, receiver) = Self::channel(origin, Rc::new(driver.clone()));
        let sender = listener.sender.clone();
        let weak = Rc::downgrade(&listener);
        let id = driver.spawn(async move {
            sender.closed().await;
            if let Some(listener) = weak.upgrade() {
                listener.mark_disconnected();
            }
        });
        listener.watcher.set(Some(id));
        (listener, receiver)
    }

    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Events successfully handed to the channel.
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.get()
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.get()
    }

    /// Tear the connection down from this side.
    pub fn disconnect(&self) {
        self.mark_disconnected();
    }

    fn mark_disconnected(&self) {
        if self.disconnected.replace(true) {
            return;
        }
        debug!(origin = %self.origin, "listener channel closed");
        self.stop_watching();
        self.post_handler();
    }

    // The watcher holds a sender; it must not outlive the listener.
    fn stop_watching(&self) {
        if let Some(id) = self.watcher.take() {
            self.timers.cancel(id);
        }
    }

    fn post_handler(&self) {
        let handler = self.handler.borrow_mut().take();
        if let Some(handler) = handler {
            self.timers.schedule(Duration::ZERO, handler);
        }
    }
}

impl ListenerEndpoint for ChannelListener {
    fn notify(&self) {
        if self.disconnected.get() {
            return;
        }
        let event = QuotaChangeEvent {
            origin: self.origin.serialization(),
            sequence: self.sent.get() + 1,
        };
        if self.sender.send(event).is_ok() {
            self.sent.set(self.sent.get() + 1);
        } else {
            self.mark_disconnected();
        }
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        *self.handler.borrow_mut() = Some(handler);
        if self.disconnected.get() || self.sender.is_closed() {
            self.disconnected.set(true);
            self.post_handler();
        }
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

/// Receiving half. `Send`; drain it from any task.
#[derive(Debug)]
pub struct ListenerReceiver {
    receiver: mpsc::UnboundedReceiver<QuotaChangeEvent>,
}

impl ListenerReceiver {
    /// Wait for the next event; `None` once the listener is gone and the
    /// channel is drained.
    pub async fn recv(&mut self) -> Option<QuotaChangeEvent> {
        self.receiver.recv().await
    }

    /// Next buffered event, if any.
    pub fn try_recv(&mut self) -> Option<QuotaChangeEvent> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting events. Buffered events can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}
