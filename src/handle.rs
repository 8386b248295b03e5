//! Async control-plane handle (spec §4.8 "Broadcast"/"Connect"), for callers
//! already inside an async context who want to drive a running
//! [`Controller`](crate::controller::Controller) without its blocking
//! `start`/`stop` surface.
//!
//! Grounded on the teacher's `client::handle::Handle`: a cheap, cloneable
//! async trait over the node's control-plane operations, with a
//! `mockall`-generated mock gated behind `#[cfg(any(test, feature =
//! "mocks"))]` so downstream crates can test against this interface without
//! a real socket.
use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::Channel;
use crate::error::{Code, Result};
use crate::registries::ChannelRegistries;
use crate::sessions::manual::ManualSession;
use crate::wire::Message;

#[async_trait]
pub trait Handle: Send + Sync {
    /// Dial `host:port` through the manual session and await the outcome of
    /// its first connection attempt.
    async fn connect(&self, host: String, port: u16) -> Result<()>;

    /// Send `msg` on every currently open channel, returning how many sends
    /// succeeded.
    async fn broadcast(&self, msg: Message) -> Result<usize>;
}

/// The concrete [`Handle`] a running controller hands out.
#[derive(Clone)]
pub struct ControllerHandle {
    manual: Arc<ManualSession>,
    registries: Arc<ChannelRegistries>,
}

impl ControllerHandle {
    pub(crate) fn new(manual: Arc<ManualSession>, registries: Arc<ChannelRegistries>) -> Self {
        Self { manual, registries }
    }
}

#[async_trait]
impl Handle for ControllerHandle {
    async fn connect(&self, host: String, port: u16) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        self.manual.connect(host, port, move |code| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(code);
            }
        });
        match rx.await {
            Ok(Code::Success) => Ok(()),
            Ok(code) => Err(code.into()),
            Err(_) => Err(Code::ChannelStopped.into()),
        }
    }

    async fn broadcast(&self, msg: Message) -> Result<usize> {
        let channels: Vec<Arc<Channel>> = self.registries.open.snapshot().await;
        let mut sent = 0;
        for channel in &channels {
            if channel.send(&msg).await.is_ok() {
                sent += 1;
            }
        }
        Ok(sent)
    }
}

#[cfg(any(test, feature = "mocks"))]
mockall::mock! {
    pub Handle {}

    impl Clone for Handle {
        fn clone(&self) -> Self;
    }

    #[async_trait]
    impl Handle for Handle {
        async fn connect(&self, host: String, port: u16) -> Result<()>;
        async fn broadcast(&self, msg: Message) -> Result<usize>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_handle_constructs() {
        let _mock = MockHandle::new();
    }

    #[tokio::test]
    async fn mock_handle_drives_a_consumer() {
        let mut mock = MockHandle::new();
        mock.expect_connect()
            .withf(|host, port| host == "example.invalid" && *port == 8333)
            .returning(|_, _| Ok(()));
        mock.expect_broadcast().returning(|_| Ok(2));

        mock.connect("example.invalid".to_string(), 8333).await.unwrap();
        assert_eq!(mock.broadcast(Message::Verack).await.unwrap(), 2);
    }
}
