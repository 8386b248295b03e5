//! Seed exchange (spec §4.6 "seed (31402)").
//!
//! Grounded on `fsm::addrmgr::AddressManager`'s seed bootstrap sequence
//! (`SAMPLE_TIMEOUT`-bounded request/response), collapsed to the spec's three
//! required events guarded by a single germination timer.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;

use crate::address::{Authority, NetworkAddress};
use crate::channel::Channel;
use crate::error::{Code, Result};
use crate::pool::AddressPool;
use crate::time::LocalTime;
use crate::wire::{Kind, Message};

use super::ProtocolTimer;

const REQUIRED_EVENTS: usize = 3;

/// Bootstraps the address pool from one seed host: send our own address
/// (unless unset), request theirs, wait for their reply, then stop the
/// channel — success or failure, the channel never outlives the exchange.
pub struct SeedProtocol {
    timer: Arc<ProtocolTimer>,
    channel: Arc<Channel>,
    pool: Arc<AddressPool>,
    self_authority: Authority,
    services: ServiceFlags,
    completed: AtomicUsize,
    finished: AtomicBool,
}

impl SeedProtocol {
    pub fn new(
        channel: Arc<Channel>,
        pool: Arc<AddressPool>,
        self_authority: Authority,
        services: ServiceFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            timer: ProtocolTimer::new(Arc::clone(&channel), false),
            channel,
            pool,
            self_authority,
            services,
            completed: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        })
    }

    pub fn start(self: &Arc<Self>, mut handler: impl FnMut(Code) + Send + 'static, germination: Duration) -> Result<()> {
        let this = Arc::clone(self);
        self.timer.start(germination, move |code| {
            if !this.finished.swap(true, Ordering::SeqCst) {
                handler(code);
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.channel.stop(code).await });
            }
        });

        if self.self_authority.port != 0 {
            self.send_own_address();
        } else {
            self.note_event();
        }
        self.send_get_address();

        let on_address = Arc::clone(self);
        self.channel.subscribe(
            Kind::Address,
            Box::new(move |code, msg| {
                if code == Code::Success {
                    if let Message::Address(addrs) = msg.as_ref() {
                        let this = Arc::clone(&on_address);
                        let addrs = addrs.clone();
                        tokio::spawn(async move { this.handle_incoming(addrs).await });
                    }
                }
                false
            }),
        )?;
        Ok(())
    }

    fn send_own_address(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let now = LocalTime::now().as_secs() as u32;
            let address = Address::new(&this.self_authority.socket_addr(), this.services);
            let _ = this
                .channel
                .send(&Message::Address(vec![(now, address)]))
                .await;
            this.note_event();
        });
    }

    fn send_get_address(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.channel.send(&Message::GetAddress).await;
            this.note_event();
        });
    }

    async fn handle_incoming(self: Arc<Self>, addrs: Vec<(u32, Address)>) {
        let addrs: Vec<NetworkAddress> = addrs
            .into_iter()
            .filter_map(|(timestamp, a)| {
                let socket = a.socket_addr().ok()?;
                Some(NetworkAddress::new(
                    socket.ip(),
                    socket.port(),
                    a.services,
                    LocalTime::from_secs(timestamp as u64),
                ))
            })
            .collect();
        let _ = self.pool.store_many(addrs, |_| {}).await;
        self.note_event();
    }

    fn note_event(self: &Arc<Self>) {
        if self.completed.fetch_add(1, Ordering::SeqCst) + 1 >= REQUIRED_EVENTS {
            self.timer.events().set_event(Code::Success);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTimers;
    use crate::pool::PoolConfig;
    use crate::wire::{self, HEADING_LEN};
    use std::net::IpAddr;
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

    async fn read_frame(client: &mut TcpStream) -> Message {
        let mut heading_buf = [0u8; HEADING_LEN];
        client.read_exact(&mut heading_buf).await.unwrap();
        let heading = wire::Heading::decode(&heading_buf);
        let mut payload = vec![0u8; heading.payload_len as usize];
        client.read_exact(&mut payload).await.unwrap();
        wire::decode_frame(bitcoin::network::Magic::BITCOIN, true, &heading, &payload).unwrap()
    }

    #[tokio::test]
    async fn completes_and_stops_channel_once_all_three_events_fire() {
        let (mut client, channel) = pair().await;
        let pool = Arc::new(AddressPool::new(PoolConfig {
            capacity: 10,
            hosts_file: None,
        }));
        pool.start().await.unwrap();
        let self_authority = Authority::new(IpAddr::from([127, 0, 0, 1]), 8333);
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let protocol = SeedProtocol::new(Arc::clone(&channel), Arc::clone(&pool), self_authority, ServiceFlags::NONE);
        protocol
            .start(
                move |code| {
                    assert_eq!(code, Code::Success);
                    d.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_secs(5),
            )
            .unwrap();

        let _ = read_frame(&mut client).await; // own address
        let _ = read_frame(&mut client).await; // getaddr

        let peer_addr = Address::new(
            &std::net::SocketAddr::from(([9, 9, 9, 9], 8333)),
            ServiceFlags::NONE,
        );
        client
            .write_all(&wire::encode_frame(
                bitcoin::network::Magic::BITCOIN,
                &Message::Address(vec![(LocalTime::now().as_secs() as u32, peer_addr)]),
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(pool.count().await, 1);
        assert!(channel.is_stopped());
    }

    #[tokio::test]
    async fn germination_timeout_stops_channel() {
        let (_client, channel) = pair().await;
        let pool = Arc::new(AddressPool::new(PoolConfig {
            capacity: 10,
            hosts_file: None,
        }));
        pool.start().await.unwrap();
        let self_authority = Authority::new(IpAddr::from([0, 0, 0, 0]), 0);
        let timed_out = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&timed_out);
        let protocol = SeedProtocol::new(Arc::clone(&channel), pool, self_authority, ServiceFlags::NONE);
        protocol
            .start(
                move |code| {
                    if code == Code::ChannelTimeout {
                        t.fetch_add(1, Ordering::SeqCst);
                    }
                },
                Duration::from_millis(40),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(timed_out.load(Ordering::SeqCst), 1);
        assert!(channel.is_stopped());
    }
}
