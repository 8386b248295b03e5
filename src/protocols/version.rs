//! Version/verack handshake (spec §4.6 "version (31402 and 70002)").
//!
//! Grounded on `fsm::peermgr::PeerManager`'s handshake bookkeeping
//! (`HANDSHAKE_TIMEOUT`, the negotiated-version field it stashes per peer)
//! and on the `VersionMessage::new` call shape used throughout the retrieved
//! handshake examples (`other_examples/844bbd60_morgueye4-btc-handshake`).
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message_network::VersionMessage;

use crate::channel::Channel;
use crate::config::{Config, REJECT_PROTOCOL_VERSION};
use crate::error::Code;
use crate::time::LocalTime;
use crate::wire::{Kind, Message, Reject, REJECT_OBSOLETE};

use super::ProtocolTimer;

/// A callback supplying the chain height to advertise. The embedding
/// application owns chain state; `meshnet` only asks for the current tip.
pub type HeightProvider = Arc<dyn Fn() -> u32 + Send + Sync>;

/// Returns the BIP 61 cause string for an insufficient peer `version`, or
/// `None` if the peer is sufficient (spec §4.6).
fn insufficiency_cause(version: &VersionMessage, config: &Config) -> Option<&'static str> {
    if version.services.to_u64() & config.invalid_services.to_u64() != 0 {
        return Some("insufficient-services");
    }
    let minimum = config.minimum_services().to_u64();
    if version.services.to_u64() & minimum != minimum {
        return Some("insufficient-services");
    }
    if version.version < config.protocol_minimum {
        return Some("insufficient-version");
    }
    None
}

/// Prefix match in either direction, per spec §4.6.
fn user_agent_blacklisted(blacklist: &[String], user_agent: &str) -> bool {
    blacklist
        .iter()
        .any(|b| user_agent.starts_with(b.as_str()) || b.starts_with(user_agent))
}

/// Runs the version/verack handshake over one channel. Completes (fires the
/// handler installed via [`VersionProtocol::start`]) after both the peer's
/// `version` and `verack` have been received, or on the first error.
pub struct VersionProtocol {
    timer: Arc<ProtocolTimer>,
    channel: Arc<Channel>,
    config: Config,
    height: HeightProvider,
    successes: AtomicUsize,
}

impl VersionProtocol {
    pub fn new(channel: Arc<Channel>, config: Config, height: HeightProvider) -> Arc<Self> {
        Arc::new(Self {
            timer: ProtocolTimer::new(Arc::clone(&channel), false),
            channel,
            config,
            height,
            successes: AtomicUsize::new(0),
        })
    }

    /// Attach the bounded handshake timer, subscribe to `version`/`verack`,
    /// and send our own `version` message.
    pub fn start(self: &Arc<Self>, handler: impl FnMut(Code) + Send + 'static) -> crate::error::Result<()> {
        self.timer.start(self.config.handshake_timeout(), handler);

        let on_version = Arc::clone(self);
        self.channel.subscribe(
            Kind::Version,
            Box::new(move |code, msg| {
                if code == Code::Success {
                    if let Message::Version(version) = msg.as_ref() {
                        let this = Arc::clone(&on_version);
                        let version = version.clone();
                        tokio::spawn(async move { this.handle_peer_version(version).await });
                    }
                }
                false
            }),
        )?;

        let on_verack = Arc::clone(self);
        self.channel.subscribe(
            Kind::Verack,
            Box::new(move |code, _msg| {
                if code == Code::Success {
                    on_verack.note_success();
                }
                false
            }),
        )?;

        self.send_own_version();
        Ok(())
    }

    fn send_own_version(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let receiver = Address::new(&this.channel.authority().socket_addr(), ServiceFlags::NONE);
            let sender = Address::new(
                &this.config.self_authority.socket_addr(),
                this.config.services,
            );
            let mut version = VersionMessage::new(
                this.config.services,
                LocalTime::now().as_secs() as i64,
                receiver,
                sender,
                this.channel.nonce(),
                this.config.user_agent.clone(),
                (this.height)() as i32,
            );
            version.version = this.config.protocol_maximum;
            if this.config.protocol_maximum >= REJECT_PROTOCOL_VERSION {
                version.relay = this.config.relay_transactions;
            }
            let _ = this.channel.send(&Message::Version(version)).await;
        });
    }

    async fn handle_peer_version(self: Arc<Self>, version: VersionMessage) {
        if user_agent_blacklisted(&self.config.user_agent_blacklist, &version.user_agent) {
            self.fail(Code::BadStream);
            return;
        }

        if self.config.protocol_maximum >= REJECT_PROTOCOL_VERSION {
            if let Some(cause) = insufficiency_cause(&version, &self.config) {
                self.send_reject(cause).await;
                self.fail(Code::BadStream);
                return;
            }
        }

        let peer_version = crate::address::PeerVersion {
            version: version.version,
            services: version.services,
            user_agent: version.user_agent.clone(),
            timestamp: LocalTime::from_secs(version.timestamp.max(0) as u64),
            start_height: version.start_height,
            relay: version.relay,
            nonce: version.nonce,
        };
        self.channel.set_peer_version(peer_version).await;
        self.channel
            .set_negotiated_version(version.version.min(self.config.protocol_maximum));

        let _ = self.channel.send(&Message::Verack).await;
        self.note_success();
    }

    async fn send_reject(&self, cause: &str) {
        let _ = self
            .channel
            .send(&Message::Reject(Reject {
                message: Kind::Version.command().to_string(),
                ccode: REJECT_OBSOLETE,
                reason: cause.to_string(),
                data: Vec::new(),
            }))
            .await;
    }

    fn note_success(self: &Arc<Self>) {
        if self.successes.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
            self.timer.events().set_event(Code::Success);
        }
    }

    fn fail(self: &Arc<Self>, code: Code) {
        self.timer.events().set_event(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTimers;
    use crate::wire::{self, HEADING_LEN};
    use std::net::{IpAddr, SocketAddr};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (TcpStream, Arc<Channel>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        let channel = Channel::new(
            server,
            peer,
            bitcoin::network::Magic::BITCOIN,
            true,
            4_000_000,
            70002,
            true,
            ChannelTimers {
                inactivity: Duration::ZERO,
                expiration: Duration::ZERO,
            },
        );
        channel.start(|_| {});
        (client, channel)
    }

    fn config() -> Config {
        let mut c = Config::default();
        c.self_authority = crate::address::Authority::new(IpAddr::from([127, 0, 0, 1]), 8333);
        c
    }

    async fn read_frame(client: &mut TcpStream) -> Message {
        let mut heading_buf = [0u8; HEADING_LEN];
        client.read_exact(&mut heading_buf).await.unwrap();
        let heading = wire::Heading::decode(&heading_buf);
        let mut payload = vec![0u8; heading.payload_len as usize];
        client.read_exact(&mut payload).await.unwrap();
        wire::decode_frame(bitcoin::network::Magic::BITCOIN, true, &heading, &payload).unwrap()
    }

    #[tokio::test]
    async fn sends_own_version_with_configured_fields() {
        let (mut client, channel) = pair().await;
        let protocol = VersionProtocol::new(channel, config(), Arc::new(|| 123));
        protocol.start(|_| {}).unwrap();

        match read_frame(&mut client).await {
            Message::Version(v) => {
                assert_eq!(v.version, REJECT_PROTOCOL_VERSION);
                assert_eq!(v.start_height, 123);
                assert!(v.relay);
            }
            other => panic!("expected version, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completes_after_version_and_verack() {
        let (mut client, channel) = pair().await;
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let protocol = VersionProtocol::new(Arc::clone(&channel), config(), Arc::new(|| 0));
        protocol
            .start(move |code| {
                assert_eq!(code, Code::Success);
                d.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let _ = read_frame(&mut client).await; // our own version

        let peer_version = VersionMessage::new(
            ServiceFlags::NONE,
            LocalTime::now().as_secs() as i64,
            Address::new(&SocketAddr::from(([127, 0, 0, 1], 0)), ServiceFlags::NONE),
            Address::new(&SocketAddr::from(([127, 0, 0, 1], 0)), ServiceFlags::NONE),
            99,
            "/test:0.1/".to_string(),
            0,
        );
        client
            .write_all(&wire::encode_frame(
                bitcoin::network::Magic::BITCOIN,
                &Message::Version(peer_version),
            ))
            .await
            .unwrap();
        client
            .write_all(&wire::encode_frame(bitcoin::network::Magic::BITCOIN, &Message::Verack))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(channel.negotiated_version(), 70002);
    }

    #[tokio::test]
    async fn insufficient_version_is_rejected_and_reported() {
        let (mut client, channel) = pair().await;
        let failed = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&failed);
        let mut cfg = config();
        cfg.protocol_minimum = 70001;
        let protocol = VersionProtocol::new(Arc::clone(&channel), cfg, Arc::new(|| 0));
        protocol
            .start(move |code| {
                if code == Code::BadStream {
                    f.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        let _ = read_frame(&mut client).await; // our own version

        let stale_version = VersionMessage::new(
            ServiceFlags::NONE,
            LocalTime::now().as_secs() as i64,
            Address::new(&SocketAddr::from(([127, 0, 0, 1], 0)), ServiceFlags::NONE),
            Address::new(&SocketAddr::from(([127, 0, 0, 1], 0)), ServiceFlags::NONE),
            99,
            "/test:0.1/".to_string(),
            0,
        );
        client
            .write_all(&wire::encode_frame(
                bitcoin::network::Magic::BITCOIN,
                &Message::Version(stale_version),
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(failed.load(Ordering::SeqCst));

        match read_frame(&mut client).await {
            Message::Reject(r) => assert_eq!(r.reason, "insufficient-version"),
            other => panic!("expected reject, got {other:?}"),
        }
    }
}
