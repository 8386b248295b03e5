//! Generic one-shot and resubscriber handler buses (spec §3 `SubscriberBus`).
//!
//! The same "fan-out registry of type-erased handlers" idea as
//! [`crate::subscriber::MessageSubscriber`] (itself grounded on the teacher's
//! `event-bus::EventBus`), generalized here over an arbitrary payload type so
//! it can back both the per-channel stop subscriber and the controller's
//! stop/connection buses (spec §4.3, §4.8) without three bespoke copies.
use std::sync::Mutex;

/// A handler fired exactly once.
pub type OneShotHandler<T> = Box<dyn FnOnce(T) + Send>;

/// Fires each subscriber exactly once with the final value, then rejects
/// further subscriptions (spec §3, "one-shot (stop)").
pub struct OneShotBus<T: Clone + Send + 'static> {
    handlers: Mutex<Vec<OneShotHandler<T>>>,
    fired: Mutex<Option<T>>,
}

impl<T: Clone + Send + 'static> Default for OneShotBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> OneShotBus<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            fired: Mutex::new(None),
        }
    }

    /// Register a handler. If the bus has already fired, the handler is
    /// invoked immediately with the stored value instead of being queued.
    pub fn subscribe(&self, handler: OneShotHandler<T>) {
        let fired = self.fired.lock().unwrap();
        if let Some(value) = fired.as_ref() {
            handler(value.clone());
            return;
        }
        drop(fired);
        self.handlers.lock().unwrap().push(handler);
    }

    /// Fire every pending handler with `value`. Idempotent: only the first
    /// call has effect; later calls are no-ops.
    pub fn fire(&self, value: T) {
        let mut fired = self.fired.lock().unwrap();
        if fired.is_some() {
            return;
        }
        *fired = Some(value.clone());
        drop(fired);

        let handlers = std::mem::take(&mut *self.handlers.lock().unwrap());
        for handler in handlers {
            handler(value.clone());
        }
    }

    pub fn has_fired(&self) -> bool {
        self.fired.lock().unwrap().is_some()
    }
}

/// A handler that stays subscribed while it returns `true`.
pub type ResubHandler<T> = Box<dyn FnMut(T) -> bool + Send>;

/// Each handler returns a boolean indicating whether to remain subscribed;
/// on stop, every remaining handler fires once with the stop value (spec
/// §3, "resubscriber (messages, connection events)").
pub struct ResubscriberBus<T: Clone + Send + 'static> {
    handlers: Mutex<Vec<ResubHandler<T>>>,
    running: Mutex<bool>,
}

impl<T: Clone + Send + 'static> Default for ResubscriberBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> ResubscriberBus<T> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            running: Mutex::new(false),
        }
    }

    pub fn start(&self) {
        *self.running.lock().unwrap() = true;
    }

    /// Open for subscriptions and returns whether it was already open
    /// (double `start` should be reported `operation_failed` by the caller).
    pub fn start_once(&self) -> bool {
        let mut running = self.running.lock().unwrap();
        let was_running = *running;
        *running = true;
        was_running
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    /// Register a handler. Errors if the bus is not accepting subscriptions.
    pub fn subscribe(&self, handler: ResubHandler<T>) -> bool {
        if !self.is_running() {
            return false;
        }
        self.handlers.lock().unwrap().push(handler);
        true
    }

    /// Publish `value` to every current handler, dropping those that return
    /// `false`.
    pub fn publish(&self, value: T) {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.retain_mut(|h| h(value.clone()));
    }

    /// Stop accepting subscriptions without firing a value to the remaining
    /// handlers — for buses with no natural "final" payload to broadcast.
    pub fn close(&self) {
        let mut running = self.running.lock().unwrap();
        if !*running {
            return;
        }
        *running = false;
        self.handlers.lock().unwrap().clear();
    }

    /// Stop accepting subscriptions and fire every remaining handler once
    /// with `value`.
    pub fn stop(&self, value: T) {
        {
            let mut running = self.running.lock().unwrap();
            if !*running {
                return;
            }
            *running = false;
        }
        let handlers = std::mem::take(&mut *self.handlers.lock().unwrap());
        for mut handler in handlers {
            handler(value.clone());
        }
    }
}
