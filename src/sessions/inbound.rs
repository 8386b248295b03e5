//! Inbound session: accepts and registers incoming connections (spec §4.7
//! "inbound").
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::address::Authority;
use crate::channel::{Channel, ChannelTimers};
use crate::error::Result;
use crate::net::Acceptor;

use super::{Session, SessionRole, SessionShared};

pub struct InboundSession {
    session: Arc<Session>,
    acceptor: Arc<Acceptor>,
}

impl InboundSession {
    pub fn new(shared: Arc<SessionShared>) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(shared),
            acceptor: Arc::new(Acceptor::new()),
        })
    }

    /// No-op if inbound is disabled (port or connection limit is 0); else
    /// binds the listener and spawns the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let shared = self.session.shared();
        if !shared.config.inbound_enabled() {
            return Ok(());
        }
        self.acceptor
            .listen(shared.config.inbound_port, shared.config.use_ipv6)
            .await?;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.accept_loop().await });
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            if self.session.is_stopped() {
                return;
            }
            match self.acceptor.accept().await {
                Ok((stream, authority)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_accept(stream, authority).await });
                }
                Err(_) => return,
            }
        }
    }

    async fn handle_accept(self: Arc<Self>, stream: TcpStream, authority: Authority) {
        let shared = self.session.shared();

        if shared.config.blacklist.contains(&authority.ip) {
            return;
        }

        let limit = shared.config.inbound_connections + shared.config.outbound_connections + shared.config.peers.len();
        if shared.registries.open.count().await >= limit {
            return;
        }

        let channel = Channel::new(
            stream,
            authority.socket_addr(),
            shared.config.identifier,
            shared.config.validate_checksum,
            shared.config.max_payload(),
            shared.config.protocol_maximum,
            true,
            ChannelTimers {
                inactivity: shared.config.inactivity_timeout(),
                expiration: shared.config.expiration_timeout(),
            },
        );
        self.session
            .establish(channel, SessionRole::Inbound, |_code| {}, |_code| {})
            .await;
    }
}
