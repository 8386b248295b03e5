//! Protocol bases: `protocol-events` and `protocol-timer` (spec §4.6).
//!
//! The teacher does not factor a reusable "protocol" unit this way — its
//! protocols are methods on one monolithic `StateMachine`
//! (`fsm::handler::StateMachine`). These bases are grounded on that state
//! machine's handshake/timeout bookkeeping (`HANDSHAKE_TIMEOUT` and friends
//! in `fsm::peermgr`) but composed as plain structs holding an `Arc<Channel>`
//! handle, per spec §9's guidance to express inheritance layers as
//! composition rather than a trait hierarchy.
pub mod address;
pub mod ping;
pub mod reject;
pub mod seed;
pub mod version;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::Channel;
use crate::error::Code;

type EventHandler = Box<dyn FnMut(Code) + Send>;

/// A single atomic "current handler or nothing" slot, swapped to empty on
/// terminal transitions (spec §9: "a single atomic holding either a closure
/// or nothing, with compare-and-swap semantics, is sufficient").
struct EventSlot {
    handler: Mutex<Option<EventHandler>>,
}

impl EventSlot {
    fn new() -> Self {
        Self {
            handler: Mutex::new(None),
        }
    }

    fn install(&self, handler: EventHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Invoke the installed handler, if any, with `code`. Terminal codes
    /// clear the slot after firing.
    fn set_event(&self, code: Code) {
        let mut slot = self.handler.lock().unwrap();
        let terminal = code.is_terminal();
        if let Some(handler) = slot.as_mut() {
            handler(code);
        }
        if terminal {
            *slot = None;
        }
    }

    fn stopped(&self) -> bool {
        self.handler.lock().unwrap().is_none()
    }
}

/// Subscribes a single completion handler to a channel's stop event and
/// exposes `set_event` for a concrete protocol to fire its own completion
/// codes through the same slot.
pub struct ProtocolEvents {
    channel: Arc<Channel>,
    slot: Arc<EventSlot>,
}

impl ProtocolEvents {
    pub fn new(channel: Arc<Channel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            slot: Arc::new(EventSlot::new()),
        })
    }

    /// Install `handler` and subscribe it to the channel's stop event.
    pub fn start(self: &Arc<Self>, handler: impl FnMut(Code) + Send + 'static) {
        self.slot.install(Box::new(handler));
        let slot = Arc::clone(&self.slot);
        self.channel.subscribe_stop(move |code| slot.set_event(code));
    }

    pub fn set_event(&self, code: Code) {
        self.slot.set_event(code);
    }

    pub fn stopped(&self) -> bool {
        self.slot.stopped()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

/// Adds one timer of configured duration on top of [`ProtocolEvents`].
/// Perpetual timers reset themselves after each fire until channel stop;
/// otherwise the timer is one-shot.
pub struct ProtocolTimer {
    events: Arc<ProtocolEvents>,
    perpetual: bool,
}

impl ProtocolTimer {
    pub fn new(channel: Arc<Channel>, perpetual: bool) -> Arc<Self> {
        Arc::new(Self {
            events: ProtocolEvents::new(channel),
            perpetual,
        })
    }

    pub fn events(&self) -> &Arc<ProtocolEvents> {
        &self.events
    }

    /// Install `handler`, subscribe to channel stop, and start the timer.
    /// On expiry the timer invokes `set_event(channel_timeout)`.
    pub fn start(self: &Arc<Self>, duration: Duration, handler: impl FnMut(Code) + Send + 'static) {
        self.events.start(handler);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(duration).await;
                if this.events.stopped() {
                    return;
                }
                this.events.set_event(Code::ChannelTimeout);
                if !this.perpetual {
                    return;
                }
            }
        });
    }
}
