//! A sliding window protocol engine: reliable, ordered, flow-controlled point-to-point
//!  transport on top of an unreliable "send-and-pray" datagram substrate.
//!
//! ## Design goals
//!
//! * Two peers, each hosting one [`session::Session`], exchange sequenced data packets and
//!   cumulative acknowledgements
//!   * the substrate may lose, reorder and duplicate packets - the engine guarantees that the
//!     consumer sees every payload exactly once, in submission order
//!   * no connection handshake: a session is bound to a local inbox and aimed at a remote
//!     inbox, and peers sync up through cumulative acks and keep-alive probes
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes)
//! * Flow control mirrors TCP's advertised window, but conveys *both* a byte and a message
//!   budget since some substrates (e.g. pub/sub brokers) impose limits on both
//!   * the advertised window piggy-backs on every outbound packet - data, ack and keep-alive
//!   * the sender reserves configurable headroom below the advertised capacity so that control
//!     traffic never overruns the substrate's queue limits
//! * Retransmission is driven by a per-slot retry deadline with a constant timeout; acks are
//!   never retried but regenerated on every relevant event, and keep-alives are generated on a
//!   timer, so all control traffic is self-repairing
//! * Round-trip times are sampled on every newly acknowledged slot and smoothed
//!   Jacobson/Karels style; the current estimate travels on outbound packets for observability
//! * An optional "as soon as possible" side-channel delivers packets unordered as they
//!   arrive, with bounded queuing and permitted drops - it never affects the ordered path
//!
//! ## Concurrency model
//!
//! Each session runs one sender task and one receiver task; they coordinate exclusively
//!  through channels (the receiver forwards ack and flow-control events to the sender, and
//!  routes its own outbound acks through the sender so that one endpoint has exactly one
//!  send context). The only shared state is the [`flow_control::FlowControl`] snapshot pair,
//!  written and read under a lock so updates are never torn.
//!
//! All time reads go through [`clock::Clock`] so tests can inject simulated time; task
//!  scheduling uses the tokio timer wheel, which the tests freeze and auto-advance for
//!  deterministic retransmission and keep-alive timing.
//!
//! ## Wire shape
//!
//! A packet is serialized as a sequence of tag-length-value fields (tag `u8`, length varint,
//!  then the value; integers are varint-encoded inside the value). Readers skip unknown tags,
//!  so fields can be added without breaking older peers. See [`packet::Packet`] for the field
//!  set. The codec is deliberately not byte-identical to any other implementation - peers
//!  agree on this crate's encoding.
//!
//! ## Related:
//! * TCP
//!   * byte-stream abstraction, single advertised window in bytes
//!   * congestion control on top of flow control - explicitly out of scope here
//! * UDT / QUIC
//!   * connection oriented with handshakes; QUIC enforces TLS
//!   * this protocol stays connectionless and unencrypted by design

pub mod asap;
pub mod clock;
pub mod error;
pub mod flow_control;
pub mod net;
pub mod packet;
pub mod receiver;
pub mod rtt;
pub mod sender;
pub mod session;
pub mod sim_net;
pub mod udp_net;
