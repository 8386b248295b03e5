use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::address::Authority;
use crate::error::{Code, Result};

/// Accept backlog for the listening socket.
const LISTEN_BACKLOG: u32 = 1024;

/// A reusable TCP listener, safe for concurrent `stop`, not safe for
/// concurrent `accept` (spec §4.2).
pub struct Acceptor {
    listener: tokio::sync::OnceCell<TcpListener>,
    listening: AtomicBool,
    cancel: CancellationToken,
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Acceptor {
    pub fn new() -> Self {
        Self {
            listener: tokio::sync::OnceCell::new(),
            listening: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Bind and begin listening on `port`. Fails with `operation_failed` if
    /// already listening, else maps the OS error to `accept_failed`.
    pub async fn listen(&self, port: u16, use_ipv6: bool) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(Code::OperationFailed.into());
        }
        let ip = if use_ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let addr = SocketAddr::new(ip, port);
        let listener = self.bind_reusable(addr).map_err(|e| {
            debug!(target: "p2p", %e, "acceptor: bind failed");
            crate::error::Error::Io(e)
        })?;
        self.listener
            .set(listener)
            .map_err(|_| Code::OperationFailed)?;
        Ok(())
    }

    /// Bind `addr` with `SO_REUSEADDR` set before listening (spec §4.2).
    fn bind_reusable(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    }

    /// Queue one asynchronous accept, racing it against `stop`. Cancellation
    /// surfaces as `service_stopped`; OS errors map to `accept_failed`.
    pub async fn accept(&self) -> Result<(TcpStream, Authority)> {
        let listener = self
            .listener
            .get()
            .ok_or(Code::OperationFailed)?;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Code::ServiceStopped.into()),
            res = listener.accept() => {
                let (stream, addr) = res.map_err(|_| Code::AcceptFailed)?;
                Ok((stream, Authority::from(addr)))
            }
        }
    }

    /// Cancel any outstanding accept. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.listening.store(false, Ordering::SeqCst);
    }
}
