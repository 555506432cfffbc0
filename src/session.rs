//! A session: one end of a reliable, ordered, flow-controlled point-to-point exchange.
//!
//! The session owns the sender and receiver tasks, wires the receiver's ack and
//!  flow-control events into the sender, and exposes the blocking `push` / `read` surface
//!  to the application. Both peers host one session each, bound to a local inbox and aimed
//!  at the remote one; no handshake is required.

use std::cmp::min;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::{Clock, RealClock};
use crate::error::SessionError;
use crate::flow_control::{Flow, FlowControl};
use crate::net::Network;
use crate::packet::Packet;
use crate::receiver::{InOrderSeq, RecvState};
use crate::sender::{PushRequest, SenderState};

pub struct SessionConfig {
    pub net: Arc<dyn Network>,
    pub local_inbox: String,
    pub dest_inbox: String,

    /// transmit and receive window, in messages
    pub window_msg_sz: i64,
    /// receive window in bytes; -1 means unbounded
    pub window_byte_sz: i64,

    /// per-slot retransmission timeout
    pub timeout: Duration,
    /// period for idle keep-alive probes
    pub keep_alive_interval: Duration,

    /// headroom below the remote advertised capacity, in bytes and messages, so that
    ///  control traffic never overruns the substrate's queue limits
    pub reserved_byte_cap: i64,
    pub reserved_msg_cap: i64,

    pub clock: Arc<dyn Clock>,
}

impl SessionConfig {
    pub fn new(
        net: Arc<dyn Network>,
        local_inbox: impl Into<String>,
        dest_inbox: impl Into<String>,
    ) -> SessionConfig {
        SessionConfig {
            net,
            local_inbox: local_inbox.into(),
            dest_inbox: dest_inbox.into(),
            window_msg_sz: 64,
            window_byte_sz: -1,
            timeout: Duration::from_millis(100),
            keep_alive_interval: Duration::from_secs(1),
            reserved_byte_cap: 0,
            reserved_msg_cap: 0,
            clock: Arc::new(RealClock),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.local_inbox.is_empty() || self.dest_inbox.is_empty() {
            bail!("both inboxes must be named");
        }
        if self.local_inbox == self.dest_inbox {
            bail!("a session cannot be aimed at its own inbox");
        }
        if self.window_msg_sz <= 0 {
            bail!("message window must be positive");
        }
        if self.window_byte_sz == 0 || self.window_byte_sz < -1 {
            bail!("byte window must be positive, or -1 for unbounded");
        }
        if self.timeout.is_zero() {
            bail!("retransmission timeout must be positive");
        }
        if self.keep_alive_interval.is_zero() {
            bail!("keep-alive interval must be positive");
        }
        if self.reserved_byte_cap < 0 || self.reserved_msg_cap < 0 {
            bail!("reserved capacities cannot be negative");
        }
        Ok(())
    }
}

pub struct Session {
    local_inbox: String,
    dest_inbox: String,

    push_tx: mpsc::Sender<PushRequest>,
    read_request_tx: mpsc::Sender<oneshot::Sender<InOrderSeq>>,
    held_count_tx: mpsc::Sender<oneshot::Sender<i64>>,
    set_asap_tx: mpsc::Sender<mpsc::Sender<Packet>>,

    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,

    flow: Arc<FlowControl>,
}

impl Session {
    pub async fn new(config: SessionConfig) -> anyhow::Result<Session> {
        config.validate()?;

        let packet_rx = config.net.listen(&config.local_inbox).await?;

        // until the first peer feedback arrives, the substrate's own queue limits are the
        //  only known bound on what may be put on the wire
        let (substrate_bytes_cap, substrate_msgs_cap) = config.net.buffer_caps();
        let local_bytes = if config.window_byte_sz < 0 {
            i64::MAX / 2
        }
        else {
            config.window_byte_sz
        };
        let flow = Arc::new(FlowControl::new(
            Flow {
                avail_reader_msg_cap: config.window_msg_sz,
                avail_reader_bytes_cap: local_bytes,
            },
            Flow {
                avail_reader_msg_cap: substrate_msgs_cap,
                avail_reader_bytes_cap: substrate_bytes_cap,
            },
        ));

        let (push_tx, push_rx) = mpsc::channel(1);
        let (ack_status_tx, ack_status_rx) = mpsc::channel(64);
        let (outbound_ack_tx, outbound_ack_rx) = mpsc::channel(64);
        let (read_request_tx, read_request_rx) = mpsc::channel(8);
        let (held_count_tx, held_count_rx) = mpsc::channel(8);
        let (set_asap_tx, set_asap_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);

        let sender = SenderState::new(
            config.net.clone(),
            config.clock.clone(),
            flow.clone(),
            config.local_inbox.clone(),
            config.dest_inbox.clone(),
            config.window_msg_sz,
            config.timeout,
            config.keep_alive_interval,
            min(config.reserved_byte_cap, substrate_bytes_cap),
            min(config.reserved_msg_cap, substrate_msgs_cap),
        );
        let receiver = RecvState::new(
            config.clock.clone(),
            flow.clone(),
            config.local_inbox.clone(),
            config.window_msg_sz,
            config.window_byte_sz,
            ack_status_tx,
            outbound_ack_tx,
        );

        let handles = vec![
            tokio::spawn(sender.run(push_rx, ack_status_rx, outbound_ack_rx, shutdown_tx.subscribe())),
            tokio::spawn(receiver.run(packet_rx, read_request_rx, held_count_rx, set_asap_rx, shutdown_tx.subscribe())),
        ];

        debug!("session {} -> {} started", config.local_inbox, config.dest_inbox);

        Ok(Session {
            local_inbox: config.local_inbox,
            dest_inbox: config.dest_inbox,
            push_tx,
            read_request_tx,
            held_count_tx,
            set_asap_tx,
            shutdown_tx,
            handles: Mutex::new(handles),
            flow,
        })
    }

    pub fn local_inbox(&self) -> &str {
        &self.local_inbox
    }

    pub fn dest_inbox(&self) -> &str {
        &self.dest_inbox
    }

    /// Submits one message for reliable ordered delivery. Blocks until the payload is
    ///  admitted to the transmit window - a free slot *and* flow-control headroom - and
    ///  transmitted for the first time. Submissions from concurrent pushers are admitted in
    ///  FIFO order.
    pub async fn push(&self, packet: Packet) -> Result<(), SessionError> {
        let (admitted_tx, admitted_rx) = oneshot::channel();
        self.push_tx
            .send(PushRequest { packet, admitted: admitted_tx })
            .await
            .map_err(|_| SessionError::Shutdown)?;
        admitted_rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// Pulls the next batch of consecutive in-order packets, blocking until at least one is
    ///  available. A cancelled read consumes nothing.
    pub async fn read(&self) -> Result<InOrderSeq, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.read_request_tx
            .send(reply_tx)
            .await
            .map_err(|_| SessionError::Shutdown)?;
        reply_rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// number of out-of-order packets currently held for reordering
    pub async fn held_count(&self) -> Result<i64, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.held_count_tx
            .send(reply_tx)
            .await
            .map_err(|_| SessionError::Shutdown)?;
        reply_rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// Installs an unordered "as soon as possible" side-channel: every arriving packet is
    ///  offered to `sink` with a bounded wait and dropped on overflow. A previously
    ///  registered sink is stopped and replaced atomically. Ordered delivery is unaffected.
    pub async fn register_asap(&self, sink: mpsc::Sender<Packet>) -> Result<(), SessionError> {
        self.set_asap_tx
            .send(sink)
            .await
            .map_err(|_| SessionError::Shutdown)
    }

    /// Drains the read side in the background. For endpoints that only ever send (their
    ///  inbound traffic is all acks) and for tests; not to be combined with
    ///  [`Session::read`] on the same session.
    pub async fn self_consume_for_testing(&self) {
        let read_request_tx = self.read_request_tx.clone();

        let handle = tokio::spawn(async move {
            loop {
                let (reply_tx, reply_rx) = oneshot::channel();
                if read_request_tx.send(reply_tx).await.is_err() {
                    break;
                }
                if reply_rx.await.is_err() {
                    break;
                }
            }
        });
        self.handles.lock().await.push(handle);
    }

    /// current advertised-window snapshots `(local, remote)`, for observability
    pub fn flow(&self) -> (Flow, Flow) {
        (self.flow.local(), self.flow.remote())
    }

    /// Signals shutdown and waits for the sender, receiver and any drain task to exit.
    ///  Idempotent; blocked `push` and `read` calls observe [`SessionError::Shutdown`].
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        debug!("session {} stopped", self.local_inbox);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim_net::SimNet;
    use bytes::Bytes;

    fn session_pair_config(net: &Arc<SimNet>, window: i64) -> (SessionConfig, SessionConfig) {
        let mut a = SessionConfig::new(net.clone() as Arc<dyn Network>, "A", "B");
        a.window_msg_sz = window;
        let mut b = SessionConfig::new(net.clone() as Arc<dyn Network>, "B", "A");
        b.window_msg_sz = window;
        (a, b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_read_roundtrip() {
        let net = Arc::new(SimNet::new(0.0, Duration::from_millis(2)));
        let (cfg_a, cfg_b) = session_pair_config(&net, 8);

        let a = Session::new(cfg_a).await.unwrap();
        let b = Session::new(cfg_b).await.unwrap();
        a.self_consume_for_testing().await;

        a.push(Packet::data("A", "B", Bytes::from_static(b"hello"))).await.unwrap();

        let batch = b.read().await.unwrap();
        assert_eq!(batch.seq.len(), 1);
        assert_eq!(batch.seq[0].seq_num, 0);
        assert_eq!(&batch.seq[0].data[..], b"hello");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_configs() {
        let net = Arc::new(SimNet::new(0.0, Duration::from_millis(2)));

        let mut config = SessionConfig::new(net.clone() as Arc<dyn Network>, "A", "A");
        assert!(config.validate().is_err());

        config = SessionConfig::new(net.clone() as Arc<dyn Network>, "A", "B");
        config.window_msg_sz = 0;
        assert!(config.validate().is_err());

        config = SessionConfig::new(net.clone() as Arc<dyn Network>, "A", "B");
        config.window_byte_sz = -2;
        assert!(config.validate().is_err());

        config = SessionConfig::new(net.clone() as Arc<dyn Network>, "A", "B");
        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = SessionConfig::new(net as Arc<dyn Network>, "A", "B");
        assert!(config.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_fails_later_pushes() {
        let net = Arc::new(SimNet::new(0.0, Duration::from_millis(2)));
        let (cfg_a, _) = session_pair_config(&net, 8);

        let a = Session::new(cfg_a).await.unwrap();
        a.stop().await;
        a.stop().await;

        let result = a.push(Packet::data("A", "B", Bytes::from_static(b"late"))).await;
        assert_eq!(result, Err(SessionError::Shutdown));
        assert_eq!(a.read().await.err(), Some(SessionError::Shutdown));
    }
}
