//! The sending half of a session: transmit-window accounting, retransmission,
//!  flow-control enforcement, RTT sampling and keep-alive generation.
//!
//! The sender runs as a single task whose event loop reacts to five inputs: a new payload
//!  submission, an ack arrival (forwarded by the local receiver), the earliest slot retry
//!  deadline, the keep-alive tick, and shutdown. All sends of this endpoint - data, ack and
//!  keep-alive - go through this task, so one endpoint has exactly one send context.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::flow_control::{Flow, FlowControl};
use crate::net::Network;
use crate::packet::{Packet, Seqno, NO_DATA_SEQNO};
use crate::rtt::RttEstimator;

/// One message admission. The submission completes when the payload has been assigned a
///  window slot and transmitted; dropping the sender side before that means the session is
///  shutting down.
pub(crate) struct PushRequest {
    pub packet: Packet,
    pub admitted: oneshot::Sender<()>,
}

/// Ack and flow-control information extracted from every arriving packet, forwarded to the
///  sender by the local receiver task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AckStatus {
    /// true for packets that are not ack-only: their `ack_num` is not meaningful, only the
    ///  piggy-backed advertised window is applied
    pub only_update_flow_ctrl: bool,
    pub ack_num: Seqno,
    /// the seq_num of the packet that carried this update
    pub ack_came_with_packet: Seqno,
    pub avail_reader_bytes_cap: i64,
    pub avail_reader_msg_cap: i64,
}

/// sender's sliding window element, occupied between enqueue and ack
struct TxqSlot {
    retry_deadline: Instant,
    packet: Option<Packet>,
}

pub struct SenderState {
    net: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    inbox: String,
    dest_inbox: String,

    window_size: i64,
    txq: Vec<TxqSlot>,

    /// highest cumulative ack received, -1 if none
    last_ack_rec: Seqno,
    /// highest sequence number assigned, -1 if none
    last_frame_sent: Seqno,

    in_flight_bytes: i64,
    /// running total of payload bytes ever enqueued - stamped on every data packet
    cumul_bytes_transmitted: i64,

    retry_timeout: Duration,
    keep_alive_interval: Duration,

    /// headroom below the remote advertised capacity, so control traffic never overruns
    ///  the substrate's queue limits
    reserved_bytes_cap: i64,
    reserved_msg_cap: i64,

    flow: Arc<FlowControl>,
    rtt: RttEstimator,

    last_transmit: Instant,
    flow_blocked: bool,

    seq_retry_count: i64,
    ack_overflow_count: i64,
}

impl SenderState {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        net: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        flow: Arc<FlowControl>,
        inbox: String,
        dest_inbox: String,
        window_size: i64,
        retry_timeout: Duration,
        keep_alive_interval: Duration,
        reserved_bytes_cap: i64,
        reserved_msg_cap: i64,
    ) -> SenderState {
        assert!(window_size > 0, "window size must be positive");

        SenderState {
            net,
            clock,
            inbox,
            dest_inbox,
            window_size,
            txq: (0..window_size)
                .map(|_| TxqSlot {
                    retry_deadline: Instant::now(),
                    packet: None,
                })
                .collect(),
            last_ack_rec: -1,
            last_frame_sent: -1,
            in_flight_bytes: 0,
            cumul_bytes_transmitted: 0,
            retry_timeout,
            keep_alive_interval,
            reserved_bytes_cap,
            reserved_msg_cap,
            flow,
            rtt: RttEstimator::new(),
            last_transmit: Instant::now(),
            flow_blocked: false,
            seq_retry_count: 0,
            ack_overflow_count: 0,
        }
    }

    /// The sender's event loop. Returns when shutdown is signalled; queued submissions are
    ///  dropped at that point, which surfaces as `Shutdown` to blocked pushers.
    pub(crate) async fn run(
        mut self,
        mut push_rx: mpsc::Receiver<PushRequest>,
        mut ack_status_rx: mpsc::Receiver<AckStatus>,
        mut outbound_ack_rx: mpsc::Receiver<Packet>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut keep_alive = time::interval(self.keep_alive_interval);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // a submission pulled from the queue but not admissible yet; holding at most one
        //  preserves FIFO order across blocked pushers
        let mut pending: Option<PushRequest> = None;

        loop {
            if let Some(req) = pending.take() {
                if self.may_transmit_new(&req.packet) {
                    if self.flow_blocked {
                        debug!("{} flow control reopened", self.inbox);
                        self.flow_blocked = false;
                    }
                    self.transmit_data(req.packet).await;
                    let _ = req.admitted.send(());
                }
                else {
                    if !self.flow_blocked {
                        debug!("{} transmit blocked: window or advertised capacity exhausted", self.inbox);
                        self.flow_blocked = true;
                    }
                    pending = Some(req);
                }
            }

            let next_retry = self.earliest_retry_deadline();

            select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(status) = ack_status_rx.recv() => {
                    self.on_ack(status);
                }
                Some(ack) = outbound_ack_rx.recv() => {
                    self.transmit_ack(ack).await;
                }
                Some(req) = push_rx.recv(), if pending.is_none() => {
                    pending = Some(req);
                }
                _ = time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => {
                    self.retransmit_due().await;
                }
                _ = keep_alive.tick() => {
                    self.maybe_send_keep_alive().await;
                }
            }
        }

        debug!("{} sender shutting down ({} retransmits, {} overflowing acks)",
            self.inbox, self.seq_retry_count, self.ack_overflow_count);
    }

    /// true iff a *new* data packet may be transmitted now: there is a free window slot and
    ///  the remote advertised capacity leaves room after the configured headroom.
    ///  Retransmissions bypass this check - their bytes are already accounted by the remote.
    fn may_transmit_new(&self, packet: &Packet) -> bool {
        let in_flight_msgs = self.last_frame_sent - self.last_ack_rec;
        if in_flight_msgs >= self.window_size {
            return false;
        }

        let remote = self.flow.remote();
        if in_flight_msgs + 1 > remote.avail_reader_msg_cap - self.reserved_msg_cap {
            return false;
        }
        if self.in_flight_bytes + packet.data.len() as i64
            > remote.avail_reader_bytes_cap - self.reserved_bytes_cap
        {
            return false;
        }
        true
    }

    async fn transmit_data(&mut self, mut packet: Packet) {
        let seq = self.last_frame_sent + 1;
        self.cumul_bytes_transmitted += packet.data.len() as i64;

        packet.from = self.inbox.clone();
        packet.dest = self.dest_inbox.clone();
        packet.seq_num = seq;
        packet.data_send_tm = self.clock.now();
        packet.cumul_bytes_transmitted = self.cumul_bytes_transmitted;
        self.stamp_flow_and_rtt(&mut packet);

        let slot = &mut self.txq[(seq % self.window_size) as usize];
        assert!(
            slot.packet.is_none(),
            "transmit slot for #{} still occupied - sequence walked out of range",
            seq
        );
        slot.retry_deadline = Instant::now() + self.retry_timeout;
        slot.packet = Some(packet.clone());

        self.last_frame_sent = seq;
        self.in_flight_bytes += packet.data.len() as i64;

        trace!("{} transmitting #{} ({} bytes, {} in flight)",
            self.inbox, seq, packet.data.len(), self.last_frame_sent - self.last_ack_rec);
        self.send_to_net(packet, "data").await;
    }

    fn on_ack(&mut self, status: AckStatus) {
        // the advertised window applies regardless of whether the ack number is meaningful
        //  or stale - the most recent values win
        self.flow.update_remote(Flow {
            avail_reader_msg_cap: status.avail_reader_msg_cap,
            avail_reader_bytes_cap: status.avail_reader_bytes_cap,
        });

        if status.only_update_flow_ctrl {
            trace!("{} flow update from #{}", self.inbox, status.ack_came_with_packet);
            return;
        }

        let k = status.ack_num;
        if k > self.last_frame_sent {
            warn!("{} ack of unsent sequence {} (last sent {}) - ignoring",
                self.inbox, k, self.last_frame_sent);
            self.ack_overflow_count += 1;
            return;
        }
        if k <= self.last_ack_rec {
            trace!("{} stale ack {} (<= {})", self.inbox, k, self.last_ack_rec);
            return;
        }

        let now = self.clock.now();
        for seq in (self.last_ack_rec + 1)..=k {
            let slot = &mut self.txq[(seq % self.window_size) as usize];
            if let Some(packet) = slot.packet.take() {
                assert_eq!(packet.seq_num, seq, "transmit slot holds wrong sequence");
                self.in_flight_bytes -= packet.data.len() as i64;
                self.rtt.sample(now - packet.data_send_tm);
            }
        }

        debug!("{} ack {} slides window from {}", self.inbox, k, self.last_ack_rec);
        self.last_ack_rec = k;
    }

    async fn retransmit_due(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();

        for seq in (self.last_ack_rec + 1)..=self.last_frame_sent {
            let slot = &mut self.txq[(seq % self.window_size) as usize];
            if let Some(packet) = &mut slot.packet {
                if slot.retry_deadline <= now {
                    packet.seq_retry += 1;
                    slot.retry_deadline = now + self.retry_timeout;
                    due.push(packet.clone());
                }
            }
        }

        for mut packet in due {
            self.seq_retry_count += 1;
            self.stamp_flow_and_rtt(&mut packet);
            debug!("{} retransmitting #{} (retry {})", self.inbox, packet.seq_num, packet.seq_retry);
            self.send_to_net(packet, "retry").await;
        }
    }

    fn earliest_retry_deadline(&self) -> Option<Instant> {
        let mut earliest = None;
        for seq in (self.last_ack_rec + 1)..=self.last_frame_sent {
            let slot = &self.txq[(seq % self.window_size) as usize];
            if slot.packet.is_some() {
                earliest = Some(match earliest {
                    None => slot.retry_deadline,
                    Some(e) if slot.retry_deadline < e => slot.retry_deadline,
                    Some(e) => e,
                });
            }
        }
        earliest
    }

    /// an ack generated by the local receiver, passed through so that all sends of this
    ///  endpoint are serialized in one task. Acks are never stored or retried.
    async fn transmit_ack(&mut self, mut ack: Packet) {
        ack.from_rtt_est_nsec = self.rtt.estimate_nsec();
        ack.from_rtt_sd_nsec = self.rtt.deviation_nsec();
        ack.from_rtt_n = self.rtt.n();

        trace!("{} sending ack {}", self.inbox, ack.ack_num);
        self.send_to_net(ack, "ack").await;
    }

    /// emits an `ack_only | keep_alive` probe if nothing has been sent for a full
    ///  keep-alive interval. The probe carries the current advertised window, so a blocked
    ///  peer learns about reopened capacity even when no data flows.
    async fn maybe_send_keep_alive(&mut self) {
        if self.last_transmit.elapsed() < self.keep_alive_interval {
            return;
        }

        let mut packet = Packet {
            from: self.inbox.clone(),
            dest: self.dest_inbox.clone(),
            seq_num: NO_DATA_SEQNO,
            ack_only: true,
            keep_alive: true,
            ..Packet::default()
        };
        self.stamp_flow_and_rtt(&mut packet);

        trace!("{} sending keep-alive", self.inbox);
        self.send_to_net(packet, "keep-alive").await;
    }

    fn stamp_flow_and_rtt(&self, packet: &mut Packet) {
        let local = self.flow.local();
        packet.avail_reader_bytes_cap = local.avail_reader_bytes_cap;
        packet.avail_reader_msg_cap = local.avail_reader_msg_cap;
        packet.from_rtt_est_nsec = self.rtt.estimate_nsec();
        packet.from_rtt_sd_nsec = self.rtt.deviation_nsec();
        packet.from_rtt_n = self.rtt.n();
    }

    /// a failed send is logged and otherwise ignored - retransmission covers data, and acks
    ///  and keep-alives are regenerated
    async fn send_to_net(&mut self, packet: Packet, why: &'static str) {
        self.last_transmit = Instant::now();
        if let Err(e) = self.net.send(packet, why).await {
            warn!("{} network send failed ({}): {:#}", self.inbox, why, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::MockNetwork;
    use bytes::Bytes;
    use rstest::rstest;

    fn unbounded_flow() -> Arc<FlowControl> {
        Arc::new(FlowControl::new(
            Flow { avail_reader_msg_cap: 1 << 20, avail_reader_bytes_cap: 1 << 40 },
            Flow { avail_reader_msg_cap: 1 << 20, avail_reader_bytes_cap: 1 << 40 },
        ))
    }

    fn sender_with_net(net: MockNetwork, window_size: i64, flow: Arc<FlowControl>) -> SenderState {
        SenderState::new(
            Arc::new(net),
            Arc::new(crate::clock::RealClock),
            flow,
            "A".to_string(),
            "B".to_string(),
            window_size,
            Duration::from_millis(100),
            Duration::from_secs(1),
            0,
            0,
        )
    }

    fn payload(text: &str) -> Packet {
        Packet::data("A", "B", Bytes::copy_from_slice(text.as_bytes()))
    }

    fn ack(k: Seqno) -> AckStatus {
        AckStatus {
            only_update_flow_ctrl: false,
            ack_num: k,
            ack_came_with_packet: NO_DATA_SEQNO,
            avail_reader_bytes_cap: 1 << 40,
            avail_reader_msg_cap: 1 << 20,
        }
    }

    #[tokio::test]
    async fn test_transmit_assigns_sequence_and_cumulative_bytes() {
        let mut net = MockNetwork::new();
        net.expect_send().times(2).returning(|_, _| Ok(()));

        let mut sender = sender_with_net(net, 4, unbounded_flow());

        sender.transmit_data(payload("abc")).await;
        sender.transmit_data(payload("defgh")).await;

        assert_eq!(sender.last_frame_sent, 1);
        assert_eq!(sender.in_flight_bytes, 8);
        assert_eq!(sender.cumul_bytes_transmitted, 8);

        let p0 = sender.txq[0].packet.as_ref().unwrap();
        let p1 = sender.txq[1].packet.as_ref().unwrap();
        assert_eq!(p0.seq_num, 0);
        assert_eq!(p0.cumul_bytes_transmitted, 3);
        assert_eq!(p1.seq_num, 1);
        assert_eq!(p1.cumul_bytes_transmitted, 8);
    }

    #[tokio::test]
    async fn test_ack_slides_window_and_samples_rtt() {
        let mut net = MockNetwork::new();
        net.expect_send().returning(|_, _| Ok(()));

        let mut sender = sender_with_net(net, 4, unbounded_flow());
        for text in ["a", "b", "c"] {
            sender.transmit_data(payload(text)).await;
        }

        sender.on_ack(ack(1));

        assert_eq!(sender.last_ack_rec, 1);
        assert_eq!(sender.in_flight_bytes, 1);
        assert!(sender.txq[0].packet.is_none());
        assert!(sender.txq[1].packet.is_none());
        assert!(sender.txq[2].packet.is_some());
        assert_eq!(sender.rtt.n(), 2);
    }

    #[tokio::test]
    async fn test_ack_is_idempotent() {
        let mut net = MockNetwork::new();
        net.expect_send().returning(|_, _| Ok(()));

        let mut sender = sender_with_net(net, 4, unbounded_flow());
        for text in ["a", "b"] {
            sender.transmit_data(payload(text)).await;
        }

        sender.on_ack(ack(0));
        let rtt_n = sender.rtt.n();

        sender.on_ack(ack(0));

        assert_eq!(sender.last_ack_rec, 0);
        assert_eq!(sender.in_flight_bytes, 1);
        assert_eq!(sender.rtt.n(), rtt_n);
    }

    #[tokio::test]
    async fn test_ack_of_unsent_sequence_is_ignored() {
        let mut net = MockNetwork::new();
        net.expect_send().returning(|_, _| Ok(()));

        let mut sender = sender_with_net(net, 4, unbounded_flow());
        sender.transmit_data(payload("a")).await;

        sender.on_ack(ack(17));

        assert_eq!(sender.last_ack_rec, -1);
        assert_eq!(sender.ack_overflow_count, 1);
        assert!(sender.txq[0].packet.is_some());
    }

    #[tokio::test]
    async fn test_stale_ack_still_applies_flow_update() {
        let mut net = MockNetwork::new();
        net.expect_send().returning(|_, _| Ok(()));

        let flow = unbounded_flow();
        let mut sender = sender_with_net(net, 4, flow.clone());
        sender.transmit_data(payload("a")).await;
        sender.on_ack(ack(0));

        sender.on_ack(AckStatus {
            avail_reader_msg_cap: 3,
            avail_reader_bytes_cap: 300,
            ..ack(0)
        });

        assert_eq!(flow.remote().avail_reader_msg_cap, 3);
        assert_eq!(flow.remote().avail_reader_bytes_cap, 300);
    }

    #[rstest]
    #[case::window_full(4, 1 << 20, 1 << 40, 0, 0, 4, false)]
    #[case::window_open(4, 1 << 20, 1 << 40, 0, 0, 3, true)]
    #[case::msg_cap_exhausted(8, 2, 1 << 40, 0, 0, 2, false)]
    #[case::msg_cap_reserved(8, 3, 1 << 40, 0, 1, 2, false)]
    #[case::byte_cap_exhausted(8, 1 << 20, 2, 0, 0, 0, false)]
    #[case::byte_cap_reserved(8, 1 << 20, 4, 2, 0, 0, false)]
    #[case::byte_cap_exact_fit(8, 1 << 20, 3, 0, 0, 0, true)]
    #[tokio::test]
    async fn test_may_transmit_new(
        #[case] window_size: i64,
        #[case] remote_msg_cap: i64,
        #[case] remote_bytes_cap: i64,
        #[case] reserved_bytes: i64,
        #[case] reserved_msgs: i64,
        #[case] prefill: i64,
        #[case] expected: bool,
    ) {
        let mut net = MockNetwork::new();
        net.expect_send().returning(|_, _| Ok(()));

        let flow = Arc::new(FlowControl::new(
            Flow { avail_reader_msg_cap: 1 << 20, avail_reader_bytes_cap: 1 << 40 },
            Flow { avail_reader_msg_cap: 1 << 20, avail_reader_bytes_cap: 1 << 40 },
        ));
        let mut sender = sender_with_net(net, window_size, flow.clone());
        sender.reserved_bytes_cap = reserved_bytes;
        sender.reserved_msg_cap = reserved_msgs;

        for i in 0..prefill {
            sender.transmit_data(payload(&format!("{}", i))).await;
        }
        flow.update_remote(Flow {
            avail_reader_msg_cap: remote_msg_cap,
            avail_reader_bytes_cap: remote_bytes_cap,
        });

        assert_eq!(sender.may_transmit_new(&payload("xyz")), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmits_after_constant_timeout() {
        let mut net = MockNetwork::new();
        net.expect_send()
            .withf(|p, why| p.seq_num == 0 && p.seq_retry == 0 && why == "data")
            .times(1)
            .returning(|_, _| Ok(()));
        net.expect_send()
            .withf(|p, why| p.seq_num == 0 && p.seq_retry >= 1 && why == "retry")
            .times(2..)
            .returning(|_, _| Ok(()));

        let flow = unbounded_flow();
        let sender = sender_with_net(net, 4, flow);

        let (push_tx, push_rx) = mpsc::channel(1);
        let (_ack_tx, ack_rx) = mpsc::channel(8);
        let (_oack_tx, oack_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(sender.run(push_rx, ack_rx, oack_rx, shutdown_rx));

        let (admitted_tx, admitted_rx) = oneshot::channel();
        push_tx
            .send(PushRequest { packet: payload("abc"), admitted: admitted_tx })
            .await
            .unwrap();
        admitted_rx.await.unwrap();

        // two full retry timeouts with no ack - the slot must be retransmitted each time
        time::sleep(Duration::from_millis(250)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_while_idle() {
        let mut net = MockNetwork::new();
        net.expect_send()
            .withf(|p, _| p.keep_alive && p.ack_only && p.seq_num == NO_DATA_SEQNO)
            .times(2..)
            .returning(|_, _| Ok(()));

        let sender = sender_with_net(net, 4, unbounded_flow());

        let (_push_tx, push_rx) = mpsc::channel::<PushRequest>(1);
        let (_ack_tx, ack_rx) = mpsc::channel(8);
        let (_oack_tx, oack_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(sender.run(push_rx, ack_rx, oack_rx, shutdown_rx));

        time::sleep(Duration::from_secs(4)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_push_admitted_after_flow_reopens() {
        let mut net = MockNetwork::new();
        net.expect_send().returning(|_, _| Ok(()));

        // remote capacity for exactly one in-flight message
        let flow = Arc::new(FlowControl::new(
            Flow { avail_reader_msg_cap: 1 << 20, avail_reader_bytes_cap: 1 << 40 },
            Flow { avail_reader_msg_cap: 1, avail_reader_bytes_cap: 1 << 40 },
        ));
        let sender = sender_with_net(net, 4, flow);

        let (push_tx, push_rx) = mpsc::channel(2);
        let (ack_tx, ack_rx) = mpsc::channel(8);
        let (_oack_tx, oack_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(sender.run(push_rx, ack_rx, oack_rx, shutdown_rx));

        let (a_tx, a_rx) = oneshot::channel();
        push_tx.send(PushRequest { packet: payload("a"), admitted: a_tx }).await.unwrap();
        a_rx.await.unwrap();

        let (b_tx, mut b_rx) = oneshot::channel();
        push_tx.send(PushRequest { packet: payload("b"), admitted: b_tx }).await.unwrap();

        // flow control is closed: the second push must stay blocked
        time::sleep(Duration::from_millis(20)).await;
        assert!(b_rx.try_recv().is_err());

        // a cumulative ack of #0 both slides the window and reopens the advertised capacity
        ack_tx.send(ack(0)).await.unwrap();
        b_rx.await.unwrap();

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
