//! The network substrate abstraction - the engine's only coupling to the outside world.
//!
//! Implemented by [`crate::sim_net::SimNet`] for deterministic tests and by
//!  [`crate::udp_net::UdpNet`] for real traffic. The contract is strictly send-and-pray:
//!  `send` makes no delivery guarantee, and the stream returned by `listen` yields packets in
//!  network arrival order, possibly duplicated, reordered or with gaps.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;

use crate::packet::Packet;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Transmits the packet. No delivery guarantee is made; `why` tags the send reason
    ///  for tracing.
    async fn send(&self, packet: Packet, why: &'static str) -> anyhow::Result<()>;

    /// Begins receiving packets addressed to `inbox`.
    async fn listen(&self, inbox: &str) -> anyhow::Result<mpsc::Receiver<Packet>>;

    /// The substrate's current queue limits `(bytes_cap, msgs_cap)`, so flow-control
    ///  headroom can be sized to avoid overrunning them.
    fn buffer_caps(&self) -> (i64, i64);
}
