//! The receiving half of a session: in-window acceptance, reordering, cumulative
//!  acknowledgement, advertised-window computation and in-order gapless delivery.
//!
//! The receiver runs as a single task. Every arriving packet - data, ack or keep-alive -
//!  updates the monotone high-water marks and the advertised window, and its piggy-backed
//!  ack and capacities are forwarded to the local sender task. Acks generated here are
//!  routed *through* the sender so that one endpoint has exactly one send context.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::asap::AsapHelper;
use crate::clock::Clock;
use crate::flow_control::{Flow, FlowControl};
use crate::packet::{in_window, Packet, Seqno, NO_DATA_SEQNO};
use crate::sender::AckStatus;

/// Ordered, gapless data as delivered to the consumer: one or more consecutive in-order
///  packets handed over as a batch.
#[derive(Debug)]
pub struct InOrderSeq {
    pub seq: Vec<Packet>,
}

/// receiver's sliding window element, occupied between arrival and in-order consumption
struct RxqSlot {
    received: bool,
    packet: Option<Packet>,
}

pub struct RecvState {
    clock: Arc<dyn Clock>,
    inbox: String,

    /// smallest sequence not yet delivered in order
    next_frame_expected: Seqno,
    rxq: Vec<RxqSlot>,
    recv_window_size: i64,
    /// receive window in bytes; -1 means unbounded
    recv_window_size_bytes: i64,

    /// held arrivals by sequence number, for fast duplicate/out-of-order lookup; entries
    ///  are removed when the consumer takes delivery
    rcvd_but_not_consumed: FxHashMap<Seqno, Packet>,
    /// contiguous packets awaiting consumer pickup
    ready_for_delivery: Vec<Packet>,
    /// sequence numbers delivered in order, for test assertions
    recv_history: Vec<Seqno>,

    largest_seqno_rcvd: Seqno,
    max_cumul_bytes_trans: i64,
    last_msg_consumed: Seqno,
    /// highest byte index consumed so far
    last_byte_consumed: i64,

    discard_count: i64,
    dup_count: i64,
    ack_count: i64,

    flow: Arc<FlowControl>,
    ack_status_tx: mpsc::Sender<AckStatus>,
    outbound_ack_tx: mpsc::Sender<Packet>,

    asap: Option<AsapHelper>,
}

impl RecvState {
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        flow: Arc<FlowControl>,
        inbox: String,
        recv_window_size: i64,
        recv_window_size_bytes: i64,
        ack_status_tx: mpsc::Sender<AckStatus>,
        outbound_ack_tx: mpsc::Sender<Packet>,
    ) -> RecvState {
        assert!(recv_window_size > 0, "window size must be positive");

        RecvState {
            clock,
            inbox,
            next_frame_expected: 0,
            rxq: (0..recv_window_size)
                .map(|_| RxqSlot {
                    received: false,
                    packet: None,
                })
                .collect(),
            recv_window_size,
            recv_window_size_bytes,
            rcvd_but_not_consumed: FxHashMap::default(),
            ready_for_delivery: Vec::new(),
            recv_history: Vec::new(),
            largest_seqno_rcvd: -1,
            max_cumul_bytes_trans: 0,
            last_msg_consumed: -1,
            last_byte_consumed: -1,
            discard_count: 0,
            dup_count: 0,
            ack_count: 0,
            flow,
            ack_status_tx,
            outbound_ack_tx,
            asap: None,
        }
    }

    /// The receiver's event loop. Ends on shutdown or when the substrate's inbound stream
    ///  closes; the ASAP helper is stopped deterministically either way.
    pub(crate) async fn run(
        mut self,
        mut packet_rx: mpsc::Receiver<Packet>,
        mut read_request_rx: mpsc::Receiver<oneshot::Sender<InOrderSeq>>,
        mut held_count_rx: mpsc::Receiver<oneshot::Sender<i64>>,
        mut set_asap_rx: mpsc::Receiver<mpsc::Sender<Packet>>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                Some(reply) = read_request_rx.recv(), if !self.ready_for_delivery.is_empty() => {
                    self.deliver(reply);
                }
                Some(reply) = held_count_rx.recv() => {
                    let _ = reply.send(self.rcvd_but_not_consumed.len() as i64);
                }
                Some(sink) = set_asap_rx.recv() => {
                    if let Some(old) = self.asap.take() {
                        old.stop().await;
                    }
                    debug!("{} installing asap side-channel", self.inbox);
                    self.asap = Some(AsapHelper::new(sink));
                }
                maybe_packet = packet_rx.recv() => {
                    match maybe_packet {
                        Some(packet) => self.on_packet(packet).await,
                        None => break,
                    }
                }
            }
        }

        if let Some(helper) = self.asap.take() {
            helper.stop().await;
        }
        debug!("{} receiver shutting down ({} delivered in order, {} dups, {} discards)",
            self.inbox, self.recv_history.len(), self.dup_count, self.discard_count);
    }

    /// Hands the whole pending batch to one reader. Consumption marks move only on a
    ///  successful handoff - a reader that gave up (timeout, cancellation) must not count
    ///  as having consumed anything, or the advertised window would open for data nobody
    ///  ever saw.
    fn deliver(&mut self, reply: oneshot::Sender<InOrderSeq>) {
        if reply.is_closed() {
            // stale request from a cancelled reader
            return;
        }

        let batch = std::mem::take(&mut self.ready_for_delivery);
        let last = batch.last().expect("delivery requires a non-empty batch");

        let previous_marks = (self.last_msg_consumed, self.last_byte_consumed);
        self.last_msg_consumed = last.seq_num;
        self.last_byte_consumed = last.cumul_bytes_transmitted - 1;

        let seqnos = batch.iter().map(|p| p.seq_num).collect::<Vec<_>>();
        trace!("{} delivering {} packets starting with #{}", self.inbox, batch.len(), seqnos[0]);

        match reply.send(InOrderSeq { seq: batch }) {
            Ok(()) => {
                for seq_num in seqnos {
                    self.rcvd_but_not_consumed.remove(&seq_num);
                }
                self.update_flow_control();
            }
            Err(returned) => {
                // the reader disappeared between the liveness check and the handoff
                self.ready_for_delivery = returned.seq;
                (self.last_msg_consumed, self.last_byte_consumed) = previous_marks;
            }
        }
    }

    async fn on_packet(&mut self, mut packet: Packet) {
        packet.arrived_at_dest_tm = self.clock.now();

        // best-effort unordered forwarding; a drop here never affects ordered processing
        if let Some(helper) = &self.asap {
            helper.offer(packet.clone()).await;
        }

        if packet.seq_num > self.largest_seqno_rcvd {
            self.largest_seqno_rcvd = packet.seq_num;
            assert!(
                packet.cumul_bytes_transmitted >= self.max_cumul_bytes_trans,
                "cumul_bytes_transmitted must be monotone in seq_num order"
            );
            self.max_cumul_bytes_trans = packet.cumul_bytes_transmitted;
        }
        assert!(
            packet.cumul_bytes_transmitted <= self.max_cumul_bytes_trans,
            "cumul_bytes_transmitted must be monotone in seq_num order"
        );

        trace!("{} received #{} from {} (ack {}, ack_only {}, keep_alive {})",
            self.inbox, packet.seq_num, packet.from, packet.ack_num, packet.ack_only, packet.keep_alive);

        // every packet piggy-backs an ack and the peer's advertised window; hand both to
        //  the local sender
        self.update_flow_control();
        let status = AckStatus {
            only_update_flow_ctrl: !packet.ack_only,
            ack_num: packet.ack_num,
            ack_came_with_packet: packet.seq_num,
            avail_reader_bytes_cap: packet.avail_reader_bytes_cap,
            avail_reader_msg_cap: packet.avail_reader_msg_cap,
        };
        if self.ack_status_tx.send(status).await.is_err() {
            // sender task is gone - the session is shutting down
            return;
        }

        if packet.keep_alive {
            // a probe soliciting flow-control feedback: respond with the current state
            self.send_ack(packet.from.clone()).await;
            return;
        }
        if packet.ack_only {
            return;
        }

        if packet.seq_num < self.next_frame_expected {
            // late duplicate of something already delivered; re-ack so the peer stops
            //  retrying it
            self.dup_count += 1;
            self.send_ack(packet.from.clone()).await;
            return;
        }

        if !in_window(
            packet.seq_num,
            self.next_frame_expected,
            self.next_frame_expected + self.recv_window_size - 1,
        ) {
            // Variation from textbook SWP: out-of-window packets are not dropped silently
            //  but acked with the current cumulative value, so a sender whose window has
            //  diverged resynchronizes instead of retrying forever.
            self.discard_count += 1;
            self.send_ack(packet.from.clone()).await;
            return;
        }

        let idx = (packet.seq_num % self.recv_window_size) as usize;
        if self.rxq[idx].received {
            self.dup_count += 1;
            return;
        }
        self.rxq[idx].received = true;
        self.rxq[idx].packet = Some(packet.clone());
        self.rcvd_but_not_consumed.insert(packet.seq_num, packet.clone());

        if packet.seq_num == self.next_frame_expected {
            // one or more frames can now be delivered in order
            loop {
                let idx = (self.next_frame_expected % self.recv_window_size) as usize;
                if !self.rxq[idx].received {
                    break;
                }
                let slot_packet = self.rxq[idx]
                    .packet
                    .take()
                    .expect("a received slot must hold a packet");
                assert_eq!(slot_packet.seq_num, self.next_frame_expected, "receive slot holds wrong sequence");

                self.rxq[idx].received = false;
                self.recv_history.push(slot_packet.seq_num);
                self.ready_for_delivery.push(slot_packet);
                self.next_frame_expected += 1;
            }
            debug!("{} in-order up to #{}, {} held",
                self.inbox, self.next_frame_expected - 1, self.rcvd_but_not_consumed.len());
            self.send_ack(packet.from.clone()).await;
        }
    }

    /// recomputes the advertised window and publishes it for the local sender to stamp on
    ///  outbound packets.
    ///
    /// Like TCP flow control, where
    ///  `advertisedWindow = maxRecvBuffer - (lastByteRcvd - nextByteRead)` - but in both
    ///  message and byte units.
    fn update_flow_control(&mut self) {
        let avail_msg = self.recv_window_size - (self.largest_seqno_rcvd - self.last_msg_consumed);
        let avail_bytes = if self.recv_window_size_bytes < 0 {
            i64::MAX / 2
        }
        else {
            self.recv_window_size_bytes - (self.max_cumul_bytes_trans - (self.last_byte_consumed + 1))
        };

        self.flow.update_local(Flow {
            avail_reader_msg_cap: avail_msg,
            avail_reader_bytes_cap: avail_bytes,
        });
    }

    /// emits a cumulative ack of `next_frame_expected - 1` carrying the current advertised
    ///  window. Acks are regenerated on every relevant event, never retried.
    async fn send_ack(&mut self, dest: String) {
        self.update_flow_control();
        self.ack_count += 1;

        let local = self.flow.local();
        let ack = Packet {
            from: self.inbox.clone(),
            dest,
            seq_num: NO_DATA_SEQNO,
            ack_num: self.next_frame_expected - 1,
            ack_only: true,
            ack_retry: self.ack_count,
            ack_reply_tm: self.clock.now(),
            avail_reader_bytes_cap: local.avail_reader_bytes_cap,
            avail_reader_msg_cap: local.avail_reader_msg_cap,
            ..Packet::default()
        };

        // the sender task being gone means the session is shutting down
        let _ = self.outbound_ack_tx.send(ack).await;
    }
}
