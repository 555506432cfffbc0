//! A deterministic network simulator with configurable latency and fault injection.
//!
//! Faults are one-shot knobs armed by test code: discard a specific sequence number once,
//!  hold back the next packet until the one after it has been dispatched (reordering), or
//!  dispatch the next packet twice (duplication). Independent per-packet loss is drawn from
//!  `loss_prob`. Per-endpoint sent/received counters support test assertions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time;
use tracing::trace;

use crate::net::Network;
use crate::packet::{Packet, Seqno};

/// extra one-way delay for a held-back packet, so it arrives after the packet that
///  overtook it
const REORDER_SKEW: Duration = Duration::from_millis(20);

struct SimNetInner {
    inboxes: FxHashMap<String, mpsc::Sender<Packet>>,

    loss_prob: f64,

    /// discard the next packet with this seq_num, once; -1 means disarmed
    discard_once: Seqno,

    /// hold back the next packet, releasing it after the one that follows
    reorder_next: bool,
    held_back: Option<Packet>,

    /// dispatch the next packet twice
    duplicate_next: bool,

    total_sent: FxHashMap<String, i64>,
}

pub struct SimNet {
    latency: Duration,
    inner: Mutex<SimNetInner>,
    total_rcvd: Arc<Mutex<FxHashMap<String, i64>>>,
}

impl SimNet {
    /// `latency` is the one-way trip time; `loss_prob` is the probability of any given
    ///  dispatch getting lost.
    pub fn new(loss_prob: f64, latency: Duration) -> SimNet {
        SimNet {
            latency,
            inner: Mutex::new(SimNetInner {
                inboxes: FxHashMap::default(),
                loss_prob,
                discard_once: -1,
                reorder_next: false,
                held_back: None,
                duplicate_next: false,
                total_sent: FxHashMap::default(),
            }),
            total_rcvd: Arc::new(Mutex::new(FxHashMap::default())),
        }
    }

    /// arms a one-shot discard of the next packet carrying `seq_num`
    pub fn discard_once(&self, seq_num: Seqno) {
        self.inner.lock().unwrap().discard_once = seq_num;
    }

    /// arms a one-shot reorder: the next packet is held back and released after the one
    ///  that follows it
    pub fn reorder_next(&self) {
        self.inner.lock().unwrap().reorder_next = true;
    }

    /// arms a one-shot duplication of the next packet
    pub fn duplicate_next(&self) {
        self.inner.lock().unwrap().duplicate_next = true;
    }

    pub fn set_loss_prob(&self, loss_prob: f64) {
        self.inner.lock().unwrap().loss_prob = loss_prob;
    }

    pub fn total_sent(&self, inbox: &str) -> i64 {
        *self.inner.lock().unwrap().total_sent.get(inbox).unwrap_or(&0)
    }

    pub fn total_rcvd(&self, inbox: &str) -> i64 {
        *self.total_rcvd.lock().unwrap().get(inbox).unwrap_or(&0)
    }

    fn dispatch(&self, tx: mpsc::Sender<Packet>, packet: Packet, latency: Duration) {
        let total_rcvd = self.total_rcvd.clone();
        tokio::spawn(async move {
            time::sleep(latency).await;
            let dest = packet.dest.clone();
            if tx.send(packet).await.is_ok() {
                *total_rcvd.lock().unwrap().entry(dest).or_insert(0) += 1;
            }
        });
    }
}

#[async_trait]
impl Network for SimNet {
    async fn send(&self, packet: Packet, why: &'static str) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();

        *inner.total_sent.entry(packet.from.clone()).or_insert(0) += 1;

        let tx = match inner.inboxes.get(&packet.dest) {
            Some(tx) => tx.clone(),
            None => bail!("simulator sees packet for unknown inbox '{}'", packet.dest),
        };

        if inner.reorder_next {
            trace!("sim: holding back packet #{} to {} ({})", packet.seq_num, packet.dest, why);
            inner.held_back = Some(packet);
            inner.reorder_next = false;
            return Ok(());
        }

        if packet.seq_num == inner.discard_once {
            trace!("sim: one-shot discard of packet #{} to {} ({})", packet.seq_num, packet.dest, why);
            inner.discard_once = -1;
            return Ok(());
        }

        let lost = inner.loss_prob > 0.0 && rand::random::<f64>() <= inner.loss_prob;
        if lost {
            trace!("sim: packet #{} to {} lost ({})", packet.seq_num, packet.dest, why);
            return Ok(());
        }

        trace!("sim: packet #{} to {} will arrive after {:?} ({})",
            packet.seq_num, packet.dest, self.latency, why);

        let duplicate = inner.duplicate_next;
        inner.duplicate_next = false;
        let held_back = inner.held_back.take();
        drop(inner);

        self.dispatch(tx.clone(), packet.clone(), self.latency);

        if let Some(held) = held_back {
            self.dispatch(tx.clone(), held, self.latency + REORDER_SKEW);
        }
        if duplicate {
            self.dispatch(tx, packet, self.latency);
        }

        Ok(())
    }

    async fn listen(&self, inbox: &str) -> anyhow::Result<mpsc::Receiver<Packet>> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.lock().unwrap().inboxes.insert(inbox.to_string(), tx);
        Ok(rx)
    }

    fn buffer_caps(&self) -> (i64, i64) {
        // limits so high they shouldn't be restrictive
        (1024 * 1024 * 1024, 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet(seq: Seqno) -> Packet {
        Packet {
            from: "A".to_string(),
            dest: "B".to_string(),
            seq_num: seq,
            ..Packet::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_and_counters() {
        let net = SimNet::new(0.0, Duration::from_millis(5));
        let mut rx = net.listen("B").await.unwrap();

        net.send(data_packet(0), "test").await.unwrap();
        let arrived = rx.recv().await.unwrap();

        assert_eq!(arrived.seq_num, 0);
        assert_eq!(net.total_sent("A"), 1);
        assert_eq!(net.total_rcvd("B"), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_inbox_fails() {
        let net = SimNet::new(0.0, Duration::from_millis(5));
        assert!(net.send(data_packet(0), "test").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_once_drops_exactly_once() {
        let net = SimNet::new(0.0, Duration::from_millis(5));
        let mut rx = net.listen("B").await.unwrap();
        net.discard_once(1);

        net.send(data_packet(1), "test").await.unwrap();
        net.send(data_packet(1), "retry").await.unwrap();

        let arrived = rx.recv().await.unwrap();
        assert_eq!(arrived.seq_num, 1);
        assert_eq!(net.total_sent("A"), 2);
        assert_eq!(net.total_rcvd("B"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reorder_next_swaps_arrival_order() {
        let net = SimNet::new(0.0, Duration::from_millis(5));
        let mut rx = net.listen("B").await.unwrap();
        net.reorder_next();

        net.send(data_packet(0), "test").await.unwrap();
        net.send(data_packet(1), "test").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().seq_num, 1);
        assert_eq!(rx.recv().await.unwrap().seq_num, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_next_delivers_twice() {
        let net = SimNet::new(0.0, Duration::from_millis(5));
        let mut rx = net.listen("B").await.unwrap();
        net.duplicate_next();

        net.send(data_packet(0), "test").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().seq_num, 0);
        assert_eq!(rx.recv().await.unwrap().seq_num, 0);
        assert_eq!(net.total_rcvd("B"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_loss_delivers_nothing() {
        let net = SimNet::new(1.0, Duration::from_millis(5));
        let mut rx = net.listen("B").await.unwrap();

        net.send(data_packet(0), "test").await.unwrap();

        time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(net.total_sent("A"), 1);
        assert_eq!(net.total_rcvd("B"), 0);
    }
}
