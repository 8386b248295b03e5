//! Address gossip (spec §4.6 "address (31402)").
//!
//! Grounded on `fsm::addrmgr::AddressManager`'s `getaddr`/`addr` exchange,
//! reshaped so the exchange lives on the owning channel's task rather than
//! being dispatched through the reactor's shared message loop.
use std::sync::Arc;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;

use crate::address::{Authority, NetworkAddress};
use crate::channel::Channel;
use crate::error::{Code, Result};
use crate::pool::AddressPool;
use crate::time::LocalTime;
use crate::wire::{Kind, Message};

/// Runs the address-gossip exchange for one channel.
pub struct AddressProtocol {
    channel: Arc<Channel>,
    pool: Arc<AddressPool>,
    self_authority: Authority,
    services: ServiceFlags,
}

impl AddressProtocol {
    pub fn new(
        channel: Arc<Channel>,
        pool: Arc<AddressPool>,
        self_authority: Authority,
        services: ServiceFlags,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            pool,
            self_authority,
            services,
        })
    }

    /// Send our own address if configured, then (if the pool accepts new
    /// entries) subscribe for incoming gossip and request the peer's.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.self_authority.port != 0 {
            self.send_own_address();
        }

        if self.pool.capacity() > 0 {
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
                    true
                }),
            )?;

            let on_getaddr = Arc::clone(self);
            self.channel.subscribe(
                Kind::GetAddress,
                Box::new(move |code, _msg| {
                    if code == Code::Success {
                        let this = Arc::clone(&on_getaddr);
                        tokio::spawn(async move { this.handle_get_address().await });
                    }
                    false
                }),
            )?;

            self.send_get_address();
        }
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
        });
    }

    fn send_get_address(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.channel.send(&Message::GetAddress).await;
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
    }

    async fn handle_get_address(self: Arc<Self>) {
        let addrs = self.pool.fetch_many().await.unwrap_or_default();
        let now = LocalTime::now().as_secs() as u32;
        let addrs = addrs
            .into_iter()
            .map(|a| (now, Address::new(&a.authority().socket_addr(), a.services)))
            .collect();
        let _ = self.channel.send(&Message::Address(addrs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTimers;
    use crate::pool::PoolConfig;
    use crate::wire::{self, HEADING_LEN};
    use std::net::IpAddr;
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

    async fn read_frame(client: &mut TcpStream) -> Message {
        let mut heading_buf = [0u8; HEADING_LEN];
        client.read_exact(&mut heading_buf).await.unwrap();
        let heading = wire::Heading::decode(&heading_buf);
        let mut payload = vec![0u8; heading.payload_len as usize];
        client.read_exact(&mut payload).await.unwrap();
        wire::decode_frame(bitcoin::network::Magic::BITCOIN, true, &heading, &payload).unwrap()
    }

    #[tokio::test]
    async fn sends_own_address_and_requests_peer_addresses() {
        let (mut client, channel) = pair().await;
        let pool = Arc::new(AddressPool::new(PoolConfig {
            capacity: 10,
            hosts_file: None,
        }));
        pool.start().await.unwrap();
        let self_authority = Authority::new(IpAddr::from([127, 0, 0, 1]), 8333);
        let protocol = AddressProtocol::new(channel, pool, self_authority, ServiceFlags::NONE);
        protocol.start().unwrap();

        match read_frame(&mut client).await {
            Message::Address(addrs) => assert_eq!(addrs.len(), 1),
            other => panic!("expected address, got {other:?}"),
        }
        match read_frame(&mut client).await {
            Message::GetAddress => {}
            other => panic!("expected getaddr, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn incoming_address_is_stored_and_getaddr_gets_one_reply() {
        let (mut client, channel) = pair().await;
        let pool = Arc::new(AddressPool::new(PoolConfig {
            capacity: 10,
            hosts_file: None,
        }));
        pool.start().await.unwrap();
        let self_authority = Authority::new(IpAddr::from([0, 0, 0, 0]), 0);
        let protocol = AddressProtocol::new(Arc::clone(&channel), Arc::clone(&pool), self_authority, ServiceFlags::NONE);
        protocol.start().unwrap();

        let _ = read_frame(&mut client).await; // our own getaddr

        let peer_addr = Address::new(
            &std::net::SocketAddr::from(([4, 5, 6, 7], 8333)),
            ServiceFlags::NONE,
        );
        client
            .write_all(&wire::encode_frame(
                bitcoin::network::Magic::BITCOIN,
                &Message::Address(vec![(LocalTime::now().as_secs() as u32, peer_addr)]),
            ))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.count().await, 1);

        client
            .write_all(&wire::encode_frame(bitcoin::network::Magic::BITCOIN, &Message::GetAddress))
            .await
            .unwrap();
        match read_frame(&mut client).await {
            Message::Address(addrs) => assert_eq!(addrs.len(), 1),
            other => panic!("expected address reply, got {other:?}"),
        }
    }
}
