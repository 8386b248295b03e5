//! Peer-to-peer networking core for a Bitcoin-family node.
//!
//! `meshnet` owns the wire protocol, channel framing, handshake and
//! bookkeeping protocols, the address pool, the four session
//! specializations, and the [`Controller`] that wires them together. The
//! embedding application supplies configuration, a chain-height callback,
//! and subscribes to connection/message events; `meshnet` does not know
//! about blocks, transactions, or consensus beyond what's needed to decode
//! and relay them.
pub mod address;
pub mod bus;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod handle;
pub mod net;
pub mod pool;
pub mod protocols;
pub mod proxy;
pub mod registries;
pub mod sessions;
pub mod subscriber;
pub mod time;
pub mod wire;

pub use address::{Authority, Endpoint, NetworkAddress, PeerVersion};
pub use channel::Channel;
pub use config::Config;
pub use controller::Controller;
pub use error::{Code, Error, Result};
pub use handle::{ControllerHandle, Handle};
pub use wire::{Kind, Message};
