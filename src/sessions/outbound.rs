//! Outbound session: N parallel dialers drawing addresses from the pool
//! (spec §4.7 "outbound").
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::channel::{Channel, ChannelTimers};
use crate::error::Code;
use crate::net::Connector;

use super::{Session, SessionRole, SessionShared};

enum BatchOutcome {
    /// Registered a channel; it later closed and a fresh batch should start
    /// right away.
    Registered,
    /// No address was available, or every connect attempt failed outright —
    /// back off before trying again.
    Failed,
    /// The pool (or the session) reported we've stopped; end the dialer.
    Stopped,
}

pub struct OutboundSession {
    session: Arc<Session>,
}

impl OutboundSession {
    pub fn new(shared: Arc<SessionShared>) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(shared),
        })
    }

    /// Spawn `outbound_connections` independent dialer tasks.
    pub fn start(self: &Arc<Self>) {
        let n = self.session.shared().config.outbound_connections;
        for _ in 0..n {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dialer_loop().await });
        }
    }

    async fn dialer_loop(self: Arc<Self>) {
        loop {
            if self.session.is_stopped() {
                return;
            }
            match self.batch_connect().await {
                BatchOutcome::Registered => continue,
                BatchOutcome::Stopped => return,
                BatchOutcome::Failed => {
                    tokio::time::sleep(self.session.shared().config.connect_timeout()).await;
                }
            }
        }
    }

    /// Fetch up to `connect_batch_size` addresses and race one connect per
    /// address; the first to succeed wins and is registered, the rest are
    /// dropped (and so cancelled).
    async fn batch_connect(self: &Arc<Self>) -> BatchOutcome {
        let shared = self.session.shared();
        let batch_size = shared.config.connect_batch_size.max(1);

        let mut addrs = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            match shared.pool.fetch_one().await {
                Ok(Some(addr)) => addrs.push(addr.authority()),
                Ok(None) => break,
                Err(_) => return BatchOutcome::Stopped,
            }
        }
        if addrs.is_empty() {
            return BatchOutcome::Failed;
        }

        let connector = Arc::new(Connector::new(shared.config.connect_timeout()));
        let attempts = addrs.into_iter().map(|authority| {
            let connector = Arc::clone(&connector);
            Box::pin(async move { connector.connect_authority(authority).await })
        });
        let (stream, authority) = match futures::future::select_ok(attempts).await {
            Ok((pair, _rest)) => pair,
            Err(_) => return BatchOutcome::Failed,
        };

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

        if shared.registries.pending_handshake.insert(Arc::clone(&channel)).await.is_err() {
            channel.stop(Code::AddressInUse).await;
            return BatchOutcome::Failed;
        }

        let registered = Arc::new(AtomicBool::new(false));
        let reg = Arc::clone(&registered);
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let closed_tx = Mutex::new(Some(closed_tx));
        self.session
            .establish(
                Arc::clone(&channel),
                SessionRole::Outbound,
                move |code| reg.store(code == Code::Success, Ordering::SeqCst),
                move |code| {
                    if let Some(tx) = closed_tx.lock().unwrap().take() {
                        let _ = tx.send(code);
                    }
                },
            )
            .await;

        if !registered.load(Ordering::SeqCst) {
            return BatchOutcome::Failed;
        }

        let _ = closed_rx.await;
        BatchOutcome::Registered
    }
}
