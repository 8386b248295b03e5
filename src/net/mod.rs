//! Socket factories: [`Acceptor`] and [`Connector`] (spec §4.2).
//!
//! Grounded on the teacher's reactor-driven socket handling
//! (`net::reactor::Reactor`) and its DNS-seed resolution in
//! `fsm::peermgr::PeerManager` (`TokioAsyncResolver`), redesigned per the
//! spec's "concurrent I/O with cancellation" requirement onto plain Tokio
//! tasks instead of a shared poll loop — see `SPEC_FULL.md` §4.2.
mod acceptor;
mod connector;

pub use acceptor::Acceptor;
pub use connector::Connector;
