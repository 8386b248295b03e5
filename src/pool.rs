//! Bounded address pool (spec §3, §4.1, §8).
//!
//! Grounded on `fsm::addrmgr::AddressManager`'s sampling and persistence
//! shape, reshaped to the spec's simpler bounded-ring-buffer semantics: no
//! range bucketing, just a capacity-bounded vector deduped by authority.
use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::address::{Authority, NetworkAddress};
use crate::error::{Code, Error, Result};

/// Configuration for [`AddressPool`]: capacity of zero disables the pool
/// entirely (spec §6 "pool.capacity").
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub hosts_file: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            hosts_file: None,
        }
    }
}

struct Inner {
    entries: Vec<NetworkAddress>,
    running: bool,
}

/// A bounded, deduplicated ring buffer of known peer addresses, persisted to
/// a newline-delimited hosts file across restarts.
pub struct AddressPool {
    config: PoolConfig,
    inner: RwLock<Inner>,
}

impl AddressPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                running: false,
            }),
        }
    }

    /// Start the pool, loading any persisted entries from the hosts file.
    /// Idempotent: starting an already-running pool is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.running {
            return Ok(());
        }
        inner.running = true;
        if self.config.capacity == 0 {
            return Ok(());
        }
        if let Some(path) = &self.config.hosts_file {
            match std::fs::File::open(path) {
                Ok(file) => {
                    let reader = BufReader::new(file);
                    for line in reader.lines() {
                        let line = line.map_err(Error::Io)?;
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if let Ok(authority) = line.parse::<Authority>() {
                            let addr = NetworkAddress::new(
                                authority.ip,
                                authority.port,
                                bitcoin::network::constants::ServiceFlags::NONE,
                                crate::time::LocalTime::now(),
                            );
                            insert_bounded(&mut inner.entries, addr, self.config.capacity);
                        }
                    }
                    debug!(target: "p2p", count = inner.entries.len(), "pool: loaded hosts file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Stop the pool, persisting its current entries to the hosts file.
    /// Idempotent: stopping an already-stopped pool is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.running {
            return Ok(());
        }
        if let Some(path) = &self.config.hosts_file {
            let mut buf = String::new();
            for entry in &inner.entries {
                buf.push_str(&entry.authority().to_string());
                buf.push('\n');
            }
            std::fs::write(path, buf).map_err(Error::Io)?;
        }
        inner.running = false;
        Ok(())
    }

    fn require_running(inner: &Inner) -> Result<()> {
        if !inner.running {
            return Err(Code::ServiceStopped.into());
        }
        Ok(())
    }

    /// Number of addresses currently held.
    pub async fn count(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Configured capacity; zero means the pool is disabled (spec §4.6
    /// address protocol: "if pool capacity > 0").
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Fetch a single random address, if any are available.
    pub async fn fetch_one(&self) -> Result<Option<NetworkAddress>> {
        let inner = self.inner.read().await;
        Self::require_running(&inner)?;
        if inner.entries.is_empty() {
            return Ok(None);
        }
        let idx = fastrand::usize(0..inner.entries.len());
        Ok(Some(inner.entries[idx].clone()))
    }

    /// Fetch a random sample of `1..=min(size, capacity/k)` addresses, where
    /// `k` is drawn uniformly from `1..20` (spec §4.1, "fetch_many").
    pub async fn fetch_many(&self) -> Result<Vec<NetworkAddress>> {
        let inner = self.inner.read().await;
        Self::require_running(&inner)?;
        if inner.entries.is_empty() {
            return Ok(Vec::new());
        }
        let k = fastrand::usize(1..20);
        let max = (inner.entries.len() / k).max(1).min(inner.entries.len());
        let n = fastrand::usize(1..=max);

        let mut shuffled: Vec<NetworkAddress> = inner.entries.clone();
        fastrand_shuffle(&mut shuffled);
        shuffled.truncate(n);
        Ok(shuffled)
    }

    /// Insert a single address, silently rejecting invalid or duplicate
    /// entries (spec §4.1, §8: "store_one never errors on bad input").
    pub async fn store_one(&self, addr: NetworkAddress) -> Result<()> {
        let mut inner = self.inner.write().await;
        Self::require_running(&inner)?;
        if self.config.capacity == 0 {
            return Ok(());
        }
        if !addr.is_valid() {
            trace!(target: "p2p", %addr.port, "pool: rejected invalid address");
            return Ok(());
        }
        insert_bounded(&mut inner.entries, addr, self.config.capacity);
        Ok(())
    }

    /// Insert many addresses via strided sampling so that a single
    /// `store_many` call doesn't let one peer flood the pool. Accepts
    /// between `capacity − size` and `min(|addrs|, capacity)` entries;
    /// `handler` fires exactly once, with the resulting code (spec §8
    /// invariant).
    pub async fn store_many(
        &self,
        addrs: Vec<NetworkAddress>,
        handler: impl FnOnce(Code) + Send,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Err(e) = Self::require_running(&inner) {
            handler(e.code());
            return Err(e);
        }
        if self.config.capacity == 0 || addrs.is_empty() {
            handler(Code::Success);
            return Ok(());
        }

        let stride = ((addrs.len() / self.config.capacity.max(1)) + 1).max(1);
        let mut seen: HashSet<Authority> =
            inner.entries.iter().map(|a| a.authority()).collect();

        for (i, addr) in addrs.into_iter().enumerate() {
            if i % stride != 0 || !addr.is_valid() {
                continue;
            }
            let authority = addr.authority();
            if seen.contains(&authority) {
                continue;
            }
            seen.insert(authority);
            insert_bounded(&mut inner.entries, addr.clone(), self.config.capacity);
        }
        handler(Code::Success);
        Ok(())
    }

    /// Remove an address by authority, if present.
    pub async fn remove(&self, authority: &Authority) -> Result<()> {
        let mut inner = self.inner.write().await;
        Self::require_running(&inner)?;
        inner.entries.retain(|a| a.authority() != *authority);
        Ok(())
    }
}

fn insert_bounded(entries: &mut Vec<NetworkAddress>, addr: NetworkAddress, capacity: usize) {
    if entries.iter().any(|a| a.authority() == addr.authority()) {
        return;
    }
    if entries.len() >= capacity {
        let idx = fastrand::usize(0..entries.len());
        entries.swap_remove(idx);
    }
    entries.push(addr);
}

fn fastrand_shuffle<T>(slice: &mut [T]) {
    let len = slice.len();
    for i in (1..len).rev() {
        let j = fastrand::usize(0..=i);
        slice.swap(i, j);
    }
}
