//! Manual session: persistent peers dialed and re-dialed by hostname (spec
//! §4.7 "manual").
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::{Channel, ChannelTimers};
use crate::error::Code;
use crate::net::Connector;

use super::{Session, SessionRole, SessionShared};

pub struct ManualSession {
    session: Arc<Session>,
    connector: Arc<Connector>,
}

impl ManualSession {
    pub fn new(shared: Arc<SessionShared>, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(shared),
            connector: Arc::new(Connector::new(connect_timeout)),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.session.is_stopped()
    }

    /// Dial `host:port`, re-dialing after every disconnect up to the
    /// configured attempt budget (0 = infinite). `on_first_connect` fires
    /// exactly once: either with the outcome of the first successful
    /// registration, or with the last error once the budget is exhausted
    /// without ever registering.
    pub fn connect(self: &Arc<Self>, host: impl Into<String>, port: u16, on_first_connect: impl FnOnce(Code) + Send + 'static) {
        let this = Arc::clone(self);
        let host = host.into();
        tokio::spawn(async move { this.dial_loop(host, port, Some(on_first_connect)).await });
    }

    /// Like [`connect`](Self::connect) but with no first-connect handler.
    pub fn connect_silent(self: &Arc<Self>, host: impl Into<String>, port: u16) {
        self.connect(host, port, |_| {});
    }

    async fn dial_loop(self: Arc<Self>, host: String, port: u16, mut on_first: Option<impl FnOnce(Code) + Send>) {
        let limit = self.session.shared().config.manual_attempt_limit;
        let mut attempt: usize = 0;

        loop {
            if self.session.is_stopped() {
                if let Some(cb) = on_first.take() {
                    cb(Code::ServiceStopped);
                }
                return;
            }
            attempt += 1;

            let (stream, authority) = match self.connector.connect(&host, port).await {
                Ok(pair) => pair,
                Err(e) => {
                    if limit != 0 && attempt >= limit {
                        if let Some(cb) = on_first.take() {
                            cb(e.code());
                        }
                        return;
                    }
                    tokio::time::sleep(self.session.shared().config.connect_timeout()).await;
                    continue;
                }
            };

            let shared = Arc::clone(self.session.shared());
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

            let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
            let closed_tx = Mutex::new(Some(closed_tx));
            let first_cb = on_first.take();
            self.session
                .establish(
                    Arc::clone(&channel),
                    SessionRole::Manual,
                    move |code| {
                        if let Some(cb) = first_cb {
                            cb(code);
                        }
                    },
                    move |code| {
                        if let Some(tx) = closed_tx.lock().unwrap().take() {
                            let _ = tx.send(code);
                        }
                    },
                )
                .await;

            let _ = closed_rx.await;

            if limit != 0 && attempt >= limit {
                return;
            }
        }
    }
}
