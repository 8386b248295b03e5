//! Heartbeat ping/pong (spec §4.6 "ping (31402 and 60001)").
//!
//! Grounded on `fsm::peermgr::PeerManager`'s keep-alive ping scheduling
//! (`PING_INTERVAL`) layered on [`super::ProtocolTimer`]'s perpetual mode: each
//! timer expiry is treated as the heartbeat tick rather than a failure, which
//! is exactly what a generic "fire on expiry" timer composes into once a
//! concrete protocol chooses what its own tick means.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::Channel;
use crate::config::PONG_PROTOCOL_VERSION;
use crate::error::Code;
use crate::wire::{Kind, Message};

use super::ProtocolTimer;

/// Runs the heartbeat ping/pong exchange for one channel. Whether pings carry
/// a nonce (and are tracked for a timely `pong`) is decided once, from the
/// channel's already-negotiated version.
pub struct PingProtocol {
    timer: Arc<ProtocolTimer>,
    channel: Arc<Channel>,
    heartbeat: Duration,
    nonced: bool,
    pending: Mutex<Option<u64>>,
}

impl PingProtocol {
    pub fn new(channel: Arc<Channel>, heartbeat: Duration) -> Arc<Self> {
        let nonced = channel.negotiated_version() >= PONG_PROTOCOL_VERSION;
        Arc::new(Self {
            timer: ProtocolTimer::new(Arc::clone(&channel), true),
            channel,
            heartbeat,
            nonced,
            pending: Mutex::new(None),
        })
    }

    /// `handler` observes non-tick events (i.e. the channel stopping); each
    /// timer expiry is intercepted as the heartbeat tick instead of being
    /// forwarded.
    pub fn start(self: &Arc<Self>, mut handler: impl FnMut(Code) + Send + 'static) -> crate::error::Result<()> {
        let this = Arc::clone(self);
        self.timer.start(self.heartbeat, move |code| {
            if code == Code::ChannelTimeout {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.on_heartbeat().await });
            } else {
                handler(code);
            }
        });

        let on_ping = Arc::clone(self);
        self.channel.subscribe(
            Kind::Ping,
            Box::new(move |code, msg| {
                if code == Code::Success {
                    if let Message::Ping(nonce) = msg.as_ref() {
                        let this = Arc::clone(&on_ping);
                        let reply = if this.nonced { *nonce } else { 0 };
                        tokio::spawn(async move {
                            let _ = this.channel.send(&Message::Pong(reply)).await;
                        });
                    }
                }
                true
            }),
        )?;

        if self.nonced {
            let on_pong = Arc::clone(self);
            self.channel.subscribe(
                Kind::Pong,
                Box::new(move |code, msg| {
                    if code == Code::Success {
                        if let Message::Pong(nonce) = msg.as_ref() {
                            on_pong.handle_pong(*nonce);
                        }
                    }
                    true
                }),
            )?;
        }
        Ok(())
    }

    async fn on_heartbeat(self: Arc<Self>) {
        if self.nonced {
            let already_pending = {
                let mut pending = self.pending.lock().unwrap();
                if pending.is_some() {
                    true
                } else {
                    *pending = Some(fastrand::u64(..));
                    false
                }
            };
            if already_pending {
                self.channel.stop(Code::ChannelTimeout).await;
                return;
            }
            let nonce = self.pending.lock().unwrap().expect("just set");
            let _ = self.channel.send(&Message::Ping(nonce)).await;
        } else {
            let _ = self.channel.send(&Message::Ping(0)).await;
        }
    }

    fn handle_pong(self: &Arc<Self>, nonce: u64) {
        let mismatched = {
            let mut pending = self.pending.lock().unwrap();
            match *pending {
                Some(expected) if expected == nonce => {
                    *pending = None;
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if mismatched {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.channel.stop(Code::BadStream).await });
        }
    }
}
