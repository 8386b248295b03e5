use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;
use tracing::debug;

use crate::address::Authority;
use crate::error::{Code, Result};

/// Resolves a hostname and races a connect attempt against a timeout (spec
/// §4.2). Grounded on `fsm::peermgr::PeerManager`'s DNS-seed lookup, which
/// already uses `TokioAsyncResolver` for hostname resolution.
pub struct Connector {
    timeout: Duration,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl Connector {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Resolve `host` and connect to `port`, racing the whole operation
    /// against `timeout`. Returns the first successfully connected socket.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(TcpStream, Authority)> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Code::ServiceStopped.into());
        }

        let attempt = async {
            let addrs = self.resolve(host, port).await?;
            self.race_connect(&addrs).await
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Code::ServiceStopped.into()),
            res = tokio::time::timeout(self.timeout, attempt) => {
                res.map_err(|_| Code::ChannelTimeout)?
            }
        }
    }

    /// Connect directly to a known `authority`, skipping resolution.
    pub async fn connect_authority(&self, authority: Authority) -> Result<(TcpStream, Authority)> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Code::ServiceStopped.into());
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Code::ServiceStopped.into()),
            res = tokio::time::timeout(self.timeout, TcpStream::connect(authority.socket_addr())) => {
                let stream = res.map_err(|_| Code::ChannelTimeout)?.map_err(|_| Code::OperationFailed)?;
                Ok((stream, authority))
            }
        }
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let response = resolver.lookup_ip(host).await.map_err(|e| {
            debug!(target: "p2p", %e, host, "connector: resolve failed");
            Code::ResolveFailed
        })?;
        let addrs: Vec<SocketAddr> = response.iter().map(|ip| SocketAddr::new(ip, port)).collect();
        if addrs.is_empty() {
            return Err(Code::ResolveFailed.into());
        }
        Ok(addrs)
    }

    /// Race a connect attempt per candidate address; the first to complete
    /// wins, the rest are dropped (and thus cancelled).
    async fn race_connect(&self, addrs: &[SocketAddr]) -> Result<(TcpStream, Authority)> {
        let attempts = addrs.iter().map(|addr| {
            let addr = *addr;
            Box::pin(async move {
                TcpStream::connect(addr)
                    .await
                    .map(|stream| (stream, Authority::from(addr)))
            })
        });

        futures::future::select_ok(attempts)
            .await
            .map(|(result, _rest)| result)
            .map_err(|_| Code::OperationFailed.into())
    }

    /// Cancel any outstanding resolve or connect. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}
