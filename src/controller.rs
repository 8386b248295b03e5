//! The P2P controller: owns configuration, the thread pool, the address
//! pool, the three channel registries, and the two subscriber buses (spec
//! §4.8).
//!
//! Grounded on `client::controller::{P2PClient, Handle}`: the teacher's
//! client owns a `flume`-backed command channel plus a single `run` future
//! driven by its embedder's own executor. Here the controller instead owns
//! its worker pool outright (spec §5.A "ambient thread pool") and exposes a
//! synchronous `start`/`run`/`stop`/`close` surface over it via
//! `Handle::block_on`/`Handle::spawn` — callers must invoke these from
//! outside any existing async context, since `block_on` panics if called
//! from within one.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::bus::ResubscriberBus;
use crate::channel::Channel;
use crate::config::Config;
use crate::error::{Code, Result};
use crate::handle::ControllerHandle;
use crate::pool::{AddressPool, PoolConfig};
use crate::protocols::version::HeightProvider;
use crate::registries::ChannelRegistries;
use crate::sessions::inbound::InboundSession;
use crate::sessions::manual::ManualSession;
use crate::sessions::outbound::OutboundSession;
use crate::sessions::seed::SeedSession;
use crate::sessions::SessionShared;
use crate::wire::Message;

/// Owns every long-lived resource a running P2P core needs, and the worker
/// pool that drives it (spec §4.8, §5).
pub struct Controller {
    config: Arc<Config>,
    pool: Arc<AddressPool>,
    registries: Arc<ChannelRegistries>,
    stop_bus: Arc<ResubscriberBus<Code>>,
    connection_bus: Arc<ResubscriberBus<Arc<Channel>>>,
    checkpoint: Arc<AtomicU32>,
    manual: Mutex<Option<Arc<ManualSession>>>,
    running: AtomicBool,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    handle: Mutex<Option<tokio::runtime::Handle>>,
}

impl Controller {
    pub fn new(config: Config) -> Self {
        let pool = AddressPool::new(PoolConfig {
            capacity: config.host_pool_capacity,
            hosts_file: config.hosts_file.clone(),
        });
        Self {
            config: Arc::new(config),
            pool: Arc::new(pool),
            registries: Arc::new(ChannelRegistries::new()),
            stop_bus: Arc::new(ResubscriberBus::new()),
            connection_bus: Arc::new(ResubscriberBus::new()),
            checkpoint: Arc::new(AtomicU32::new(0)),
            manual: Mutex::new(None),
            running: AtomicBool::new(false),
            runtime: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Record the current chain tip, advertised as `start_height` in every
    /// subsequent `version` handshake.
    pub fn set_checkpoint(&self, height: u32) {
        self.checkpoint.store(height, Ordering::SeqCst);
    }

    pub fn checkpoint(&self) -> u32 {
        self.checkpoint.load(Ordering::SeqCst)
    }

    fn height_provider(&self) -> HeightProvider {
        let checkpoint = Arc::clone(&self.checkpoint);
        Arc::new(move || checkpoint.load(Ordering::SeqCst))
    }

    fn make_shared(&self) -> Arc<SessionShared> {
        Arc::new(SessionShared {
            config: Arc::clone(&self.config),
            registries: Arc::clone(&self.registries),
            pool: Arc::clone(&self.pool),
            connection_bus: Arc::clone(&self.connection_bus),
            stop_bus: Arc::clone(&self.stop_bus),
            height: self.height_provider(),
        })
    }

    fn rebuild_runtime(&self) -> Result<()> {
        let mut runtime_guard = self.runtime.lock().unwrap();
        if let Some(old) = runtime_guard.take() {
            old.shutdown_background();
        }
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();
        if self.config.threads > 0 {
            builder.worker_threads(self.config.threads);
        }
        let rt = builder.build().map_err(|_| Code::OperationFailed)?;
        *self.handle.lock().unwrap() = Some(rt.handle().clone());
        *runtime_guard = Some(rt);
        Ok(())
    }

    /// Start sequence (spec §4.8): fails atomically if already running or if
    /// any step errors.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Code::OperationFailed.into());
        }

        let result = self.try_start();
        if result.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        result
    }

    fn try_start(&self) -> Result<()> {
        if !self.config.has_valid_protocol_range() {
            return Err(Code::OperationFailed.into());
        }
        self.rebuild_runtime()?;
        let handle = self
            .handle
            .lock()
            .unwrap()
            .clone()
            .expect("runtime just built");
        handle.block_on(self.start_async())
    }

    async fn start_async(&self) -> Result<()> {
        self.stop_bus.start();
        self.connection_bus.start();

        let shared = self.make_shared();
        let manual = ManualSession::new(Arc::clone(&shared), self.config.connect_timeout());
        *self.manual.lock().unwrap() = Some(manual);

        self.pool.start().await?;

        let seed = SeedSession::new(shared, self.config.connect_timeout());
        seed.start().await?;

        debug!(target: "p2p", "controller: started");
        Ok(())
    }

    /// Run sequence (spec §4.8): dial every configured peer, then bring up
    /// the inbound and outbound sessions.
    pub fn run(&self) -> Result<()> {
        let handle = self.handle.lock().unwrap().clone().ok_or(Code::ServiceStopped)?;
        handle.block_on(self.run_async())
    }

    async fn run_async(&self) -> Result<()> {
        if let Some(manual) = self.manual.lock().unwrap().clone() {
            for peer in self.config.peers.clone() {
                manual.connect_silent(peer.host, peer.port);
            }
        }

        let shared = self.make_shared();
        let inbound = InboundSession::new(Arc::clone(&shared));
        inbound.start().await?;

        let outbound = OutboundSession::new(shared);
        outbound.start();

        debug!(target: "p2p", "controller: running");
        Ok(())
    }

    /// Dial `host:port` through the manual session. If the controller is not
    /// currently started, `handler` fires immediately with `service_stopped`
    /// (spec §8 scenario 4).
    pub fn connect(&self, host: impl Into<String>, port: u16, handler: impl FnOnce(Code) + Send + 'static) {
        let manual = self.manual.lock().unwrap().clone();
        let handle = self.handle.lock().unwrap().clone();
        let host = host.into();
        match (manual, handle) {
            (Some(manual), Some(handle)) => {
                handle.spawn(async move { manual.connect(host, port, handler) });
            }
            _ => handler(Code::ServiceStopped),
        }
    }

    /// Snapshot the open-channels registry and send `msg` on each. `per_channel`
    /// fires once per channel with the send outcome; `on_complete` fires once
    /// every send has finished, in any order (spec §4.8 "Broadcast").
    pub fn broadcast(
        &self,
        msg: Message,
        per_channel: impl Fn(Code) + Send + Sync + 'static,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        let handle = self.handle.lock().unwrap().clone().ok_or(Code::ServiceStopped)?;
        let registries = Arc::clone(&self.registries);
        handle.spawn(async move {
            let channels = registries.open.snapshot().await;
            let per_channel = Arc::new(per_channel);
            let mut tasks = Vec::with_capacity(channels.len());
            for channel in channels {
                let per_channel = Arc::clone(&per_channel);
                let msg = msg.clone();
                tasks.push(tokio::spawn(async move {
                    let code = match channel.send(&msg).await {
                        Ok(()) => Code::Success,
                        Err(e) => e.code(),
                    };
                    per_channel(code);
                }));
            }
            for task in tasks {
                let _ = task.await;
            }
            on_complete();
        });
        Ok(())
    }

    /// An async handle over this controller's control plane, for callers
    /// already inside an async context. `None` if the controller isn't
    /// currently started.
    pub fn handle(&self) -> Option<ControllerHandle> {
        let manual = self.manual.lock().unwrap().clone()?;
        Some(ControllerHandle::new(manual, Arc::clone(&self.registries)))
    }

    /// `handler` fires once per successfully-registered, notify-enabled
    /// channel; it returns whether it wants to stay subscribed.
    pub fn subscribe_connection(&self, handler: impl FnMut(Arc<Channel>) -> bool + Send + 'static) -> bool {
        self.connection_bus.subscribe(Box::new(handler))
    }

    /// `handler` fires at most once, when the controller stops.
    pub fn subscribe_stop(&self, handler: impl FnOnce(Code) + Send + 'static) {
        let mut handler = Some(handler);
        self.stop_bus.subscribe(Box::new(move |code| {
            if let Some(h) = handler.take() {
                h(code);
            }
            false
        }));
    }

    /// Idempotent, non-blocking stop (spec §4.8). Returns whether the
    /// address pool was saved successfully — the only way this can "fail".
    pub fn stop(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        *self.manual.lock().unwrap() = None;

        let handle = self.handle.lock().unwrap().clone();
        match handle {
            Some(handle) => handle.block_on(self.stop_async()),
            None => true,
        }
    }

    async fn stop_async(&self) -> bool {
        let saved = self.pool.stop().await.is_ok();
        self.stop_bus.stop(Code::ServiceStopped);
        self.connection_bus.close();
        self.registries.stop_all(Code::ServiceStopped).await;
        debug!(target: "p2p", "controller: stopped");
        saved
    }

    /// Calls [`stop`](Self::stop), then joins the thread pool, blocking
    /// until every spawned task finishes.
    pub fn close(&self) -> bool {
        let saved = self.stop();
        *self.handle.lock().unwrap() = None;
        if let Some(rt) = self.runtime.lock().unwrap().take() {
            drop(rt);
        }
        saved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut c = Config::default();
        c.outbound_connections = 0;
        c.inbound_connections = 0;
        c.inbound_port = 0;
        c.host_pool_capacity = 0;
        c.seeds.clear();
        c.peers.clear();
        c
    }

    #[test]
    fn start_with_no_sessions_succeeds_then_stop_saves() {
        let controller = Controller::new(config());
        controller.start().unwrap();
        assert!(controller.stop());
    }

    #[test]
    fn double_start_fails() {
        let controller = Controller::new(config());
        controller.start().unwrap();
        let err = controller.start().unwrap_err();
        assert_eq!(err.code(), Code::OperationFailed);
        controller.stop();
    }

    #[test]
    fn start_rejects_invalid_protocol_range() {
        let mut c = config();
        c.protocol_minimum = c.protocol_maximum + 1;
        let controller = Controller::new(c);
        let err = controller.start().unwrap_err();
        assert_eq!(err.code(), Code::OperationFailed);
    }

    #[test]
    fn connect_before_start_reports_service_stopped() {
        let controller = Controller::new(config());
        let got = Arc::new(AtomicU32::new(0));
        let g = Arc::clone(&got);
        controller.connect("127.0.0.1", 1, move |code| {
            if code == Code::ServiceStopped {
                g.store(1, Ordering::SeqCst);
            }
        });
        assert_eq!(got.load(Ordering::SeqCst), 1);
    }
}
