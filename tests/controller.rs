//! Black-box controller scenarios run over real loopback sockets.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message_network::VersionMessage;
use bitcoin::network::Magic;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use meshnet::wire::{self, Message, HEADING_LEN};
use meshnet::{Authority, Code, Config, Controller, Endpoint};

fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn base_config() -> Config {
    let mut c = Config::default();
    c.outbound_connections = 0;
    c.inbound_connections = 0;
    c.inbound_port = 0;
    c.host_pool_capacity = 0;
    c.seeds.clear();
    c.peers.clear();
    c.self_authority = Authority::new(std::net::IpAddr::from([127, 0, 0, 1]), 0);
    c
}

/// Reads the peer's `version`, answers with our own `version` + `verack`,
/// then drains anything sent afterwards until the socket closes.
async fn fake_peer_handshake(mut stream: TcpStream) {
    let mut heading_buf = [0u8; HEADING_LEN];
    if stream.read_exact(&mut heading_buf).await.is_err() {
        return;
    }
    let heading = wire::Heading::decode(&heading_buf);
    let mut payload = vec![0u8; heading.payload_len as usize];
    if stream.read_exact(&mut payload).await.is_err() {
        return;
    }

    let version = VersionMessage::new(
        ServiceFlags::NONE,
        0,
        Address::new(&SocketAddr::from(([127, 0, 0, 1], 0)), ServiceFlags::NONE),
        Address::new(&SocketAddr::from(([127, 0, 0, 1], 0)), ServiceFlags::NONE),
        fastrand::u64(..),
        "/fakepeer:0.1/".to_string(),
        0,
    );
    if stream
        .write_all(&wire::encode_frame(Magic::BITCOIN, &Message::Version(version)))
        .await
        .is_err()
    {
        return;
    }
    if stream
        .write_all(&wire::encode_frame(Magic::BITCOIN, &Message::Verack))
        .await
        .is_err()
    {
        return;
    }

    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn spawn_handshaking_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(fake_peer_handshake(stream));
                }
                Err(_) => return,
            }
        }
    });
    addr
}

/// Accepts connections but never writes anything back — every handshake
/// against it times out.
async fn spawn_silent_peer() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    // Hold the connection open without ever reading or writing.
                    std::mem::forget(stream);
                }
                Err(_) => return,
            }
        }
    });
    addr
}

#[test]
fn seed_with_zero_handshake_timeout_is_peer_throttling() {
    init_tracing();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let peer_addr = rt.block_on(spawn_silent_peer());

    let mut config = base_config();
    config.host_pool_capacity = 10;
    config.channel_handshake_seconds = 0;
    config.seeds = vec![Endpoint::new(peer_addr.ip().to_string(), peer_addr.port())];

    let controller = Controller::new(config);
    let err = controller.start().unwrap_err();
    assert_eq!(err.code(), Code::PeerThrottling);
    controller.stop();
}

#[test]
fn duplicate_connect_is_address_in_use() {
    init_tracing();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let peer_addr = rt.block_on(spawn_handshaking_peer());

    let controller = Controller::new(base_config());
    controller.start().unwrap();
    controller.run().unwrap();

    let first_code = Arc::new(std::sync::Mutex::new(None));
    let fc = Arc::clone(&first_code);
    controller.connect(peer_addr.ip().to_string(), peer_addr.port(), move |code| {
        *fc.lock().unwrap() = Some(code);
    });

    // Give the first connect time to finish its handshake and register.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*first_code.lock().unwrap(), Some(Code::Success));

    let second_code = Arc::new(std::sync::Mutex::new(None));
    let sc = Arc::clone(&second_code);
    controller.connect(peer_addr.ip().to_string(), peer_addr.port(), move |code| {
        *sc.lock().unwrap() = Some(code);
    });

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(*second_code.lock().unwrap(), Some(Code::AddressInUse));
    controller.close();
}

#[test]
fn broadcast_on_two_channels_fires_per_channel_and_completion() {
    init_tracing();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (peer_a, peer_b) = rt.block_on(async { (spawn_handshaking_peer().await, spawn_handshaking_peer().await) });

    let controller = Controller::new(base_config());
    controller.start().unwrap();
    controller.run().unwrap();

    let registered = Arc::new(AtomicUsize::new(0));
    for peer in [peer_a, peer_b] {
        let r = Arc::clone(&registered);
        controller.connect(peer.ip().to_string(), peer.port(), move |code| {
            if code == Code::Success {
                r.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(registered.load(Ordering::SeqCst), 2);

    let per_channel_hits = Arc::new(AtomicUsize::new(0));
    let per_channel_successes = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let hits = Arc::clone(&per_channel_hits);
    let successes = Arc::clone(&per_channel_successes);
    let c = Arc::clone(&completed);
    controller
        .broadcast(
            Message::Ping(1),
            move |code| {
                hits.fetch_add(1, Ordering::SeqCst);
                if code == Code::Success {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            },
            move || c.store(true, Ordering::SeqCst),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(per_channel_hits.load(Ordering::SeqCst), 2);
    assert_eq!(per_channel_successes.load(Ordering::SeqCst), 2);
    assert!(completed.load(Ordering::SeqCst));
    controller.close();
}
