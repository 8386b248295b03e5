//! Session base and the shared state every session variant is built from
//! (spec §4.7).
//!
//! Grounded on the connection-lifecycle bookkeeping spread across
//! `fsm::peermgr::PeerManager` (connect/accept/negotiate/disconnect) and
//! `client::service::Service` (wiring a decoder plus state machine per
//! accepted socket), reshaped into the spec's shared `Session` base plus one
//! struct per concrete session type.
pub mod inbound;
pub mod manual;
pub mod outbound;
pub mod seed;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::bus::ResubscriberBus;
use crate::channel::Channel;
use crate::config::Config;
use crate::error::{Code, Result};
use crate::pool::AddressPool;
use crate::protocols::address::AddressProtocol;
use crate::protocols::ping::PingProtocol;
use crate::protocols::reject::RejectProtocol;
use crate::protocols::version::{HeightProvider, VersionProtocol};
use crate::registries::ChannelRegistries;

/// Resources every session needs, owned by the controller and handed down
/// by reference so each session type can be constructed independently.
pub struct SessionShared {
    pub config: Arc<Config>,
    pub registries: Arc<ChannelRegistries>,
    pub pool: Arc<AddressPool>,
    pub connection_bus: Arc<ResubscriberBus<Arc<Channel>>>,
    pub stop_bus: Arc<ResubscriberBus<Code>>,
    pub height: HeightProvider,
}

/// Which registration variant a channel is going through — determines the
/// `handshake_complete` override (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Seed,
    Manual,
    Inbound,
    Outbound,
}

/// Owns a stop subscription on the controller; every concrete session type
/// is built on top of one.
pub struct Session {
    shared: Arc<SessionShared>,
    stopped: Arc<AtomicBool>,
}

impl Session {
    pub fn new(shared: Arc<SessionShared>) -> Arc<Self> {
        let session = Arc::new(Self {
            shared,
            stopped: Arc::new(AtomicBool::new(false)),
        });
        let stopped = Arc::clone(&session.stopped);
        session.shared.stop_bus.subscribe(Box::new(move |_code| {
            stopped.store(true, Ordering::SeqCst);
            false
        }));
        session
    }

    pub fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// The registration sequence common to all sessions (spec §4.7): start
    /// the channel, run the version handshake, hand off to the
    /// role-specific `handshake_complete`, then subscribe a stop handler
    /// that removes the channel from the open registry.
    ///
    /// `started` fires once, with the outcome of the whole sequence.
    /// `stopped` fires once, when the channel eventually stops (which may
    /// be immediately, if registration itself failed).
    pub async fn establish(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        role: SessionRole,
        started: impl FnOnce(Code) + Send + 'static,
        stopped: impl FnOnce(Code) + Send + 'static,
    ) {
        if self.is_stopped() {
            started(Code::ServiceStopped);
            stopped(Code::ServiceStopped);
            return;
        }

        channel.start(|_| {});

        if let Err(e) = self.run_handshake(&channel).await {
            let code = e.code();
            started(code);
            channel.stop(code).await;
            stopped(code);
            return;
        }

        if let Err(e) = self.handshake_complete(&channel, role).await {
            let code = e.code();
            started(code);
            channel.stop(code).await;
            stopped(code);
            return;
        }

        started(Code::Success);

        let registries = Arc::clone(&self.shared.registries);
        let authority = channel.authority();
        channel.subscribe_stop(move |code| {
            tokio::spawn(async move {
                registries.open.remove(&authority).await;
            });
            stopped(code);
        });

        if role != SessionRole::Seed {
            self.attach_ongoing_protocols(&channel);
        }
    }

    async fn run_handshake(&self, channel: &Arc<Channel>) -> Result<()> {
        let protocol = VersionProtocol::new(
            Arc::clone(channel),
            (*self.shared.config).clone(),
            Arc::clone(&self.shared.height),
        );
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        protocol.start(move |code| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(code);
            }
        })?;
        match rx.await {
            Ok(Code::Success) => Ok(()),
            Ok(code) => Err(code.into()),
            Err(_) => Err(Code::ChannelStopped.into()),
        }
    }

    /// Default registration: insert into the open registry, fail with
    /// `address_in_use` on a duplicate authority (spec §4.7 step 5).
    async fn handshake_complete(&self, channel: &Arc<Channel>, role: SessionRole) -> Result<()> {
        match role {
            SessionRole::Inbound => {
                let loopback = match channel.peer_version().await {
                    Some(v) => self.shared.registries.pending_handshake.contains_nonce(v.nonce).await,
                    None => false,
                };
                if loopback {
                    return Err(Code::AcceptFailed.into());
                }
                self.shared.registries.open.insert(Arc::clone(channel)).await?;
            }
            SessionRole::Outbound => {
                self.shared.registries.pending_handshake.remove(channel.nonce()).await;
                self.shared.registries.open.insert(Arc::clone(channel)).await?;
            }
            SessionRole::Seed | SessionRole::Manual => {
                self.shared.registries.open.insert(Arc::clone(channel)).await?;
            }
        }
        if channel.notify() {
            self.shared.connection_bus.publish(Arc::clone(channel));
        }
        Ok(())
    }

    /// Attach the address-gossip, heartbeat, and reject-logging protocols
    /// that run for the lifetime of a long-lived (non-seed) channel.
    fn attach_ongoing_protocols(&self, channel: &Arc<Channel>) {
        let address = AddressProtocol::new(
            Arc::clone(channel),
            Arc::clone(&self.shared.pool),
            self.shared.config.self_authority,
            self.shared.config.services,
        );
        let _ = address.start();

        let ping = PingProtocol::new(Arc::clone(channel), self.shared.config.heartbeat_interval());
        let _ = ping.start(|_| {});

        let reject = RejectProtocol::new(Arc::clone(channel));
        let _ = reject.start();
    }
}
