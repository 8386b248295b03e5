//! Proxy plus handshake state and the two channel timers (spec §3, §4.4).
//!
//! Timer duration/Display types are carried over from the teacher's
//! `net::time::{LocalTime, LocalDuration}`; the teacher's single-threaded
//! `TimeoutManager<K>` wheel is replaced by two `tokio::time::sleep` futures
//! owned by this channel's own tasks (`SPEC_FULL.md` §4.4).
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::network::Magic;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::address::{Authority, PeerVersion};
use crate::error::{Code, Result};
use crate::proxy::{Proxy, ProxyConfig};
use crate::subscriber::Handler;
use crate::time::jitter;
use crate::wire::{Kind, Message};

/// Durations governing a channel's two independent timers (spec §6).
#[derive(Debug, Clone, Copy)]
pub struct ChannelTimers {
    pub inactivity: Duration,
    pub expiration: Duration,
}

/// One TCP connection: an owned [`Proxy`] plus handshake bookkeeping and the
/// inactivity/expiration timers.
pub struct Channel {
    proxy: Arc<Proxy>,
    nonce: u64,
    notify: AtomicBool,
    peer_version: AsyncMutex<Option<Arc<PeerVersion>>>,
    cancel: CancellationToken,
}

impl Channel {
    /// Construct a channel over an already-connected socket. The nonce is
    /// generated once, here, and advertised in our own `version` message.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        magic: Magic,
        validate_checksum: bool,
        max_payload: u32,
        own_max_version: u32,
        notify: bool,
        timers: ChannelTimers,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let activity = Arc::new(Notify::new());

        let cancel_for_stop = cancel.clone();
        let proxy_config = ProxyConfig {
            magic,
            validate_checksum,
            max_payload,
        };

        let activity_for_hook = Arc::clone(&activity);
        let proxy = Proxy::new(
            stream,
            peer,
            proxy_config,
            own_max_version,
            Box::new(move || cancel_for_stop.cancel()),
            Box::new(move || activity_for_hook.notify_one()),
        );

        let channel = Arc::new(Self {
            proxy,
            nonce: fastrand::u64(..),
            notify: AtomicBool::new(notify),
            peer_version: AsyncMutex::new(None),
            cancel,
        });

        channel.spawn_inactivity_timer(activity, timers.inactivity);
        channel.spawn_expiration_timer(timers.expiration);
        channel
    }

    fn spawn_inactivity_timer(self: &Arc<Self>, activity: Arc<Notify>, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let this = Arc::clone(self);
        let cancel = this.cancel.clone();
        tokio::spawn(async move {
            loop {
                let deadline = tokio::time::Instant::now() + duration;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = activity.notified() => continue,
                    _ = tokio::time::sleep_until(deadline) => {
                        trace!(target: "p2p", authority = %this.authority(), "channel: inactivity timeout");
                        this.stop(Code::ChannelTimeout).await;
                        return;
                    }
                }
            }
        });
    }

    fn spawn_expiration_timer(self: &Arc<Self>, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        let this = Arc::clone(self);
        let cancel = this.cancel.clone();
        let mut rng = fastrand::Rng::new();
        let jittered = jitter(duration.into(), &mut rng);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(jittered.into()) => {
                    trace!(target: "p2p", authority = %this.authority(), "channel: expired");
                    this.stop(Code::ChannelTimeout).await;
                }
            }
        });
    }

    pub fn authority(&self) -> Authority {
        self.proxy.authority()
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn notify(&self) -> bool {
        self.notify.load(Ordering::SeqCst)
    }

    pub fn negotiated_version(&self) -> u32 {
        self.proxy.negotiated_version()
    }

    pub fn set_negotiated_version(&self, version: u32) {
        self.proxy.set_negotiated_version(version);
    }

    pub async fn peer_version(&self) -> Option<Arc<PeerVersion>> {
        self.peer_version.lock().await.clone()
    }

    pub async fn set_peer_version(&self, version: PeerVersion) {
        *self.peer_version.lock().await = Some(Arc::new(version));
    }

    pub fn subscribe(&self, kind: Kind, handler: Handler) -> Result<()> {
        self.proxy.subscribe(kind, handler)
    }

    pub fn subscribe_stop(&self, handler: impl FnOnce(Code) + Send + 'static) {
        self.proxy.subscribe_stop(handler);
    }

    pub fn start(self: &Arc<Self>, on_start: impl FnOnce(Code) + Send + 'static) {
        self.proxy.start(on_start);
    }

    pub async fn send(&self, msg: &Message) -> Result<()> {
        self.proxy.send(msg).await
    }

    /// Stop the channel: cancels both timers (via the proxy's `on_stopping`
    /// hook) and runs the proxy stop sequence. `channel_stopped` and
    /// `service_stopped` are additionally treated as the channel's own
    /// stopped state (spec §4.4).
    pub async fn stop(&self, code: Code) {
        self.proxy.stop(code).await;
    }

    pub fn is_stopped(&self) -> bool {
        self.proxy.is_stopped()
    }

    /// True if the proxy has stopped, or if `code` is itself one of the two
    /// terminal codes (spec §4.4).
    pub fn stopped(&self, code: Code) -> bool {
        self.proxy.is_stopped() || matches!(code, Code::ChannelStopped | Code::ServiceStopped)
    }
}
