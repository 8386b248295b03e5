//! Reject logging (spec §4.6 "reject (70002)").
//!
//! Version-targeted rejects are handled inline by the version protocol; this
//! one only logs what is left — rejects for messages sent after the
//! handshake (e.g. a peer rejecting a `tx` or `block`).
use std::sync::Arc;

use tracing::debug;

use crate::channel::Channel;
use crate::error::{Code, Result};
use crate::wire::{Kind, Message};

pub struct RejectProtocol {
    channel: Arc<Channel>,
}

impl RejectProtocol {
    pub fn new(channel: Arc<Channel>) -> Arc<Self> {
        Arc::new(Self { channel })
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        let authority = self.channel.authority();
        self.channel.subscribe(
            Kind::Reject,
            Box::new(move |code, msg| {
                if code == Code::Success {
                    if let Message::Reject(r) = msg.as_ref() {
                        debug!(
                            target: "p2p",
                            %authority,
                            message = %r.message,
                            ccode = r.ccode,
                            reason = %r.reason,
                            "peer sent reject"
                        );
                    }
                }
                true
            }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTimers;
    use crate::wire::{self, Reject};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn incoming_reject_does_not_stop_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
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
        let protocol = RejectProtocol::new(Arc::clone(&channel));
        protocol.start().unwrap();

        client
            .write_all(&wire::encode_frame(
                bitcoin::network::Magic::BITCOIN,
                &Message::Reject(Reject {
                    message: "tx".to_string(),
                    ccode: 0x40,
                    reason: "dust".to_string(),
                    data: Vec::new(),
                }),
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!channel.is_stopped());
    }
}
