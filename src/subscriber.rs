//! Per-channel message subscriber bus (spec §3, §4.5).
//!
//! Grounded on the teacher's sibling `event-bus` crate (`EventBus`,
//! `TypeId`-keyed map of channel sender/receiver pairs): the same "table of
//! type-erased handlers" idea, but keyed by the closed [`Kind`] enumeration
//! instead of `TypeId`, and scoped per-channel rather than global (spec §9
//! design notes).
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::Code;
use crate::wire::{self, Kind, Message};

/// A handler for decoded messages of a given kind. Returns whether it
/// should remain subscribed.
pub type Handler = Box<dyn Fn(Code, Arc<Message>) -> bool + Send + Sync>;

/// Dispatch discipline for a message kind (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Fire-and-forget, off the calling task.
    Relay,
    /// Synchronous, serialized on the caller.
    Invoke,
}

/// `block`, `transaction`, and the handshake pair back-pressure the proxy's
/// read loop; everything else relays.
fn dispatch_mode(kind: Kind) -> DispatchMode {
    match kind {
        Kind::Block | Kind::Transaction | Kind::Version | Kind::Verack => DispatchMode::Invoke,
        _ => DispatchMode::Relay,
    }
}

struct Slot {
    handlers: Mutex<Vec<Handler>>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
        }
    }
}

/// One resubscribable publisher per message kind, with a `load` entry point
/// that decodes raw bytes and fans them out.
pub struct MessageSubscriber {
    slots: HashMap<Kind, Slot>,
    running: Mutex<bool>,
}

impl Default for MessageSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageSubscriber {
    pub fn new() -> Self {
        let kinds = [
            Kind::Version,
            Kind::Verack,
            Kind::Ping,
            Kind::Pong,
            Kind::Address,
            Kind::GetAddress,
            Kind::Reject,
            Kind::Inv,
            Kind::GetData,
            Kind::NotFound,
            Kind::Transaction,
            Kind::Block,
            Kind::Headers,
            Kind::MerkleBlock,
            Kind::FilterLoad,
            Kind::FilterAdd,
            Kind::FilterClear,
            Kind::FeeFilter,
            Kind::SendHeaders,
            Kind::SendCompact,
            Kind::CompactBlock,
            Kind::BlockTransactions,
            Kind::GetBlockTransactions,
            Kind::MemoryPool,
            Kind::Alert,
            Kind::DoubleSpendProof,
            Kind::XVersion,
            Kind::Unknown,
        ];
        let slots = kinds.into_iter().map(|k| (k, Slot::default())).collect();
        Self {
            slots,
            running: Mutex::new(false),
        }
    }

    pub fn start(&self) {
        *self.running.lock().unwrap() = true;
    }

    /// Stop accepting subscriptions and broadcast the stop code to every
    /// handler still registered, clearing all slots.
    pub fn stop(&self, code: Code) {
        {
            let mut running = self.running.lock().unwrap();
            if !*running {
                return;
            }
            *running = false;
        }
        self.broadcast(code);
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    /// Register a handler for a given kind. Errors with
    /// [`Code::ChannelStopped`] if the bus is no longer accepting subscriptions.
    pub fn subscribe(&self, kind: Kind, handler: Handler) -> Result<(), Code> {
        if !self.is_running() {
            return Err(Code::ChannelStopped);
        }
        self.slots
            .get(&kind)
            .expect("every kind has a slot")
            .handlers
            .lock()
            .unwrap()
            .push(handler);
        Ok(())
    }

    /// Decode `payload` as `kind` at `negotiated_version` and publish it to
    /// every current subscriber of that kind (spec §4.5 `load`). A command
    /// that doesn't match any known kind returns `not_found` without
    /// stopping the channel; any other parse failure returns `bad_stream`.
    /// Neither case reaches a handler.
    pub fn load(self: &Arc<Self>, kind: Kind, negotiated_version: u32, payload: &[u8]) -> Result<(), Code> {
        if kind == Kind::Unknown {
            return Err(Code::NotFound);
        }
        let msg = wire::decode_kind(kind, negotiated_version, payload).map_err(|e: io::Error| {
            trace!(target: "p2p", %e, ?kind, "subscriber: decode failed");
            Code::BadStream
        })?;
        self.publish(kind, Code::Success, Arc::new(msg));
        Ok(())
    }

    /// Publish `(code, empty message)` on every kind's subscriber — used by
    /// the proxy on stop (spec §4.5 `broadcast`).
    pub fn broadcast(&self, code: Code) {
        for kind in self.slots.keys().copied().collect::<Vec<_>>() {
            let placeholder = Arc::new(Message::Unknown {
                command: kind.command().to_string(),
                payload: Vec::new(),
            });
            self.publish_sync(kind, code, placeholder);
        }
    }

    fn publish(self: &Arc<Self>, kind: Kind, code: Code, msg: Arc<Message>) {
        match dispatch_mode(kind) {
            DispatchMode::Invoke => self.publish_sync(kind, code, msg),
            DispatchMode::Relay => {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    this.publish_sync(kind, code, msg);
                });
            }
        }
    }

    fn publish_sync(&self, kind: Kind, code: Code, msg: Arc<Message>) {
        let slot = match self.slots.get(&kind) {
            Some(s) => s,
            None => return,
        };
        let mut handlers = slot.handlers.lock().unwrap();
        handlers.retain(|h| h(code, Arc::clone(&msg)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn subscribe_before_start_is_rejected() {
        let bus = MessageSubscriber::new();
        let err = bus
            .subscribe(Kind::Ping, Box::new(|_, _| true))
            .unwrap_err();
        assert_eq!(err, Code::ChannelStopped);
    }

    #[test]
    fn load_dispatches_to_handler() {
        let bus = Arc::new(MessageSubscriber::new());
        bus.start();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        bus.subscribe(
            Kind::Ping,
            Box::new(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
                true
            }),
        )
        .unwrap();

        let frame = wire::encode_frame(bitcoin::network::Magic::BITCOIN, &Message::Ping(7));
        let payload = &frame[wire::HEADING_LEN..];
        bus.load(Kind::Ping, 70002, payload).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_with_bad_payload_is_bad_stream() {
        let bus = Arc::new(MessageSubscriber::new());
        bus.start();
        let err = bus.load(Kind::Ping, 70002, &[0u8; 1]).unwrap_err();
        assert_eq!(err, Code::BadStream);
    }

    #[test]
    fn load_unknown_kind_is_not_found_without_dispatch() {
        let bus = Arc::new(MessageSubscriber::new());
        bus.start();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        bus.subscribe(Kind::Unknown, Box::new(move |_, _| {
            counted.fetch_add(1, Ordering::SeqCst);
            true
        }))
        .unwrap();

        let err = bus.load(Kind::Unknown, 70002, &[]).unwrap_err();
        assert_eq!(err, Code::NotFound);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn load_double_spend_proof_is_success_unknown_message() {
        let bus = Arc::new(MessageSubscriber::new());
        bus.start();
        bus.load(Kind::DoubleSpendProof, 70002, &[1, 2, 3]).unwrap();
    }

    #[test]
    fn handler_unsubscribes_on_false() {
        let bus = Arc::new(MessageSubscriber::new());
        bus.start();
        bus.subscribe(Kind::GetAddress, Box::new(|_, _| false))
            .unwrap();
        bus.publish_sync(Kind::GetAddress, Code::Success, Arc::new(Message::GetAddress));
        assert_eq!(
            bus.slots
                .get(&Kind::GetAddress)
                .unwrap()
                .handlers
                .lock()
                .unwrap()
                .len(),
            0
        );
    }

    #[test]
    fn stop_broadcasts_and_is_idempotent() {
        let bus = MessageSubscriber::new();
        bus.start();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&count);
        bus.subscribe(
            Kind::Pong,
            Box::new(move |code, _| {
                assert_eq!(code, Code::ChannelStopped);
                counted.fetch_add(1, Ordering::SeqCst);
                true
            }),
        )
        .unwrap();
        bus.stop(Code::ChannelStopped);
        bus.stop(Code::ChannelStopped);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
