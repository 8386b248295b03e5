//! Seed session: bootstraps the address pool from the configured seed list,
//! then disconnects (spec §4.7 "seed").
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::address::Endpoint;
use crate::channel::{Channel, ChannelTimers};
use crate::error::{Code, Result};
use crate::net::Connector;
use crate::protocols::seed::SeedProtocol;

use super::{Session, SessionRole, SessionShared};

pub struct SeedSession {
    session: Arc<Session>,
    connector: Arc<Connector>,
}

impl SeedSession {
    pub fn new(shared: Arc<SessionShared>, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(shared),
            connector: Arc::new(Connector::new(connect_timeout)),
        })
    }

    /// Seed the pool from every configured endpoint concurrently. Success
    /// iff the pool, having started empty, gained at least one address.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let shared = Arc::clone(self.session.shared());
        if shared.pool.capacity() == 0 {
            return Ok(());
        }
        if shared.pool.count().await > 0 {
            return Ok(());
        }

        let germination = shared.config.germination_timeout();
        let tasks: Vec<_> = shared
            .config
            .seeds
            .clone()
            .into_iter()
            .map(|endpoint| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.seed_one(endpoint, germination).await })
            })
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        if shared.pool.count().await > 0 {
            Ok(())
        } else {
            Err(Code::PeerThrottling.into())
        }
    }

    async fn seed_one(self: Arc<Self>, endpoint: Endpoint, germination: Duration) {
        let (stream, authority) = match self.connector.connect(&endpoint.host, endpoint.port).await {
            Ok(pair) => pair,
            Err(_) => return,
        };

        let shared = Arc::clone(self.session.shared());
        let channel = Channel::new(
            stream,
            authority.socket_addr(),
            shared.config.identifier,
            shared.config.validate_checksum,
            shared.config.max_payload(),
            shared.config.protocol_maximum,
            false,
            ChannelTimers {
                inactivity: Duration::ZERO,
                expiration: Duration::ZERO,
            },
        );

        let registered = Arc::new(AtomicBool::new(false));
        let reg = Arc::clone(&registered);
        self.session
            .establish(
                Arc::clone(&channel),
                SessionRole::Seed,
                move |code| reg.store(code == Code::Success, Ordering::SeqCst),
                |_code| {},
            )
            .await;

        if !registered.load(Ordering::SeqCst) {
            return;
        }

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let done_tx = Mutex::new(Some(done_tx));
        let seed_protocol = SeedProtocol::new(
            Arc::clone(&channel),
            Arc::clone(&shared.pool),
            shared.config.self_authority,
            shared.config.services,
        );
        let started = seed_protocol.start(
            move |_code| {
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            },
            germination,
        );
        if started.is_ok() {
            let _ = done_rx.await;
        }
    }
}
