//! Framed message I/O over one socket (spec §4.3).
//!
//! Grounded on the teacher's `client::stream::Decoder` (incremental decode
//! loop) and `crates/types/src/messages/p2p.rs`'s heading layout, run here as
//! a read loop owned by its own Tokio task rather than driven by an external
//! reactor (`SPEC_FULL.md` §4.3, §9 REDESIGN FLAGS).
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bitcoin::network::Magic;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use crate::address::Authority;
use crate::bus::OneShotBus;
use crate::error::{Code, Error, Result};
use crate::subscriber::{Handler, MessageSubscriber};
use crate::wire::{self, Heading, Kind, Message, HEADING_LEN};

/// Configuration a proxy needs at construction: everything in spec §6 that
/// governs frame validation.
#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    pub magic: Magic,
    pub validate_checksum: bool,
    pub max_payload: u32,
}

/// Framed message I/O over a single TCP socket with typed dispatch to a
/// [`MessageSubscriber`].
pub struct Proxy {
    authority: Authority,
    config: ProxyConfig,
    writer: AsyncMutex<OwnedWriteHalf>,
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    negotiated_version: AtomicU32,
    subscriber: Arc<MessageSubscriber>,
    stop_bus: OneShotBus<Code>,
    stopped: AtomicBool,
    on_stopping: Box<dyn Fn() + Send + Sync>,
    on_activity: Box<dyn Fn() + Send + Sync>,
}

impl Proxy {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        config: ProxyConfig,
        own_max_version: u32,
        on_stopping: Box<dyn Fn() + Send + Sync>,
        on_activity: Box<dyn Fn() + Send + Sync>,
    ) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        Arc::new(Self {
            authority: Authority::from(peer),
            config,
            writer: AsyncMutex::new(writer),
            reader: AsyncMutex::new(Some(reader)),
            negotiated_version: AtomicU32::new(own_max_version),
            subscriber: Arc::new(MessageSubscriber::new()),
            stop_bus: OneShotBus::new(),
            stopped: AtomicBool::new(false),
            on_stopping,
            on_activity,
        })
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn negotiated_version(&self) -> u32 {
        self.negotiated_version.load(Ordering::SeqCst)
    }

    pub fn set_negotiated_version(&self, version: u32) {
        self.negotiated_version.store(version, Ordering::SeqCst);
    }

    pub fn subscribe(&self, kind: Kind, handler: Handler) -> Result<()> {
        self.subscriber
            .subscribe(kind, handler)
            .map_err(Error::Code)
    }

    pub fn subscribe_stop(&self, handler: impl FnOnce(Code) + Send + 'static) {
        self.stop_bus.subscribe(Box::new(handler));
    }

    /// Transition from stopped to running: open the subscriber bus, invoke
    /// `on_start` for subscription setup, then begin the read cycle as an
    /// owned background task.
    pub fn start(self: &Arc<Self>, on_start: impl FnOnce(Code) + Send + 'static) {
        self.subscriber.start();
        on_start(Code::Success);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_read_cycle().await;
        });
    }

    async fn run_read_cycle(self: Arc<Self>) {
        let mut reader = match self.reader.lock().await.take() {
            Some(r) => r,
            None => return,
        };

        loop {
            match self.read_one(&mut reader).await {
                Ok(()) => continue,
                Err(code) => {
                    self.stop(code).await;
                    return;
                }
            }
        }
    }

    async fn read_one(&self, reader: &mut OwnedReadHalf) -> std::result::Result<(), Code> {
        let mut heading_buf = [0u8; HEADING_LEN];
        reader.read_exact(&mut heading_buf).await.map_err(|e| {
            trace!(target: "p2p", %e, authority = %self.authority, "proxy: read error");
            Code::BadStream
        })?;
        let heading = Heading::decode(&heading_buf);

        if heading.magic != self.config.magic {
            debug!(target: "p2p", authority = %self.authority, "proxy: bad magic");
            return Err(Code::BadStream);
        }
        if heading.payload_len > self.config.max_payload {
            debug!(target: "p2p", authority = %self.authority, len = heading.payload_len, "proxy: payload too large");
            return Err(Code::BadStream);
        }

        let mut payload = vec![0u8; heading.payload_len as usize];
        reader.read_exact(&mut payload).await.map_err(|_| Code::BadStream)?;

        if self.config.validate_checksum && wire::checksum(&payload) != heading.checksum {
            debug!(target: "p2p", authority = %self.authority, "proxy: bad checksum");
            return Err(Code::BadStream);
        }

        let kind = Kind::from_command(&heading.command_str());
        self.subscriber
            .load(kind, self.negotiated_version(), &payload)?;
        (self.on_activity)();
        Ok(())
    }

    /// Serialize and write `msg` at the current negotiated version, holding
    /// the write lock for the duration so concurrent sends never interleave.
    pub async fn send(&self, msg: &Message) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Code::ServiceStopped.into());
        }
        let frame = wire::encode_frame(self.config.magic, msg);
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await.map_err(Error::Io)?;
        Ok(())
    }

    /// Idempotent stop sequence (spec §4.3): mark stopped, broadcast
    /// `channel_stopped` to message subscribers, fire the stop subscriber,
    /// run the subclass hook, then close the socket.
    pub async fn stop(&self, code: Code) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscriber.stop(Code::ChannelStopped);
        self.stop_bus.fire(code);
        (self.on_stopping)();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Message;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    fn config() -> ProxyConfig {
        ProxyConfig {
            magic: Magic::BITCOIN,
            validate_checksum: true,
            max_payload: 4_000_000,
        }
    }

    #[tokio::test]
    async fn start_invokes_handler_before_first_read() {
        let (client, server, peer) = pair().await;
        drop(client);
        let proxy = Proxy::new(server, peer, config(), 70002, Box::new(|| {}), Box::new(|| {}));
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        proxy.start(move |code| {
            assert_eq!(code, Code::Success);
            f.store(true, Ordering::SeqCst);
        });
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn send_then_receive_roundtrip() {
        let (client, server, peer) = pair().await;
        let proxy = Proxy::new(server, peer, config(), 70002, Box::new(|| {}), Box::new(|| {}));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        proxy
            .subscribe(
                Kind::Ping,
                Box::new(move |code, _| {
                    assert_eq!(code, Code::Success);
                    c.fetch_add(1, Ordering::SeqCst);
                    true
                }),
            )
            .unwrap();
        proxy.start(|_| {});

        let frame = wire::encode_frame(Magic::BITCOIN, &Message::Ping(5));
        let mut client = client;
        client.write_all(&frame).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_fires_stop_subscriber_once() {
        let (client, server, peer) = pair().await;
        drop(client);
        let proxy = Proxy::new(server, peer, config(), 70002, Box::new(|| {}), Box::new(|| {}));
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        proxy.subscribe_stop(move |code| {
            assert_eq!(code, Code::ChannelTimeout);
            c.fetch_add(1, Ordering::SeqCst);
        });
        proxy.stop(Code::ChannelTimeout).await;
        proxy.stop(Code::BadStream).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_magic_stops_with_bad_stream() {
        let (mut client, server, peer) = pair().await;
        let proxy = Proxy::new(server, peer, config(), 70002, Box::new(|| {}), Box::new(|| {}));
        let stopped = Arc::new(AtomicBool::new(false));
        let s = stopped.clone();
        proxy.subscribe_stop(move |code| {
            assert_eq!(code, Code::BadStream);
            s.store(true, Ordering::SeqCst);
        });
        proxy.start(|_| {});

        let mut frame = wire::encode_frame(Magic::BITCOIN, &Message::Verack);
        frame[0] ^= 0xff;
        client.write_all(&frame).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(stopped.load(Ordering::SeqCst));
    }
}
