//! Best-effort unordered forwarding: the "as soon as possible" side-channel.
//!
//! A helper owns a bounded queue between the receiver task and a consumer-provided sink.
//!  The receiver offers every arriving packet with a bounded wait; on overflow or timeout
//!  the packet is dropped. The ordered delivery path is never affected - this channel gives
//!  no ordering, no gap-freedom and no duplicate suppression.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::packet::Packet;

const QUEUE_DEPTH: usize = 16;

/// how long the receiver is willing to wait for queue space before dropping
const ENQUEUE_WAIT: Duration = Duration::from_millis(300);

pub struct AsapHelper {
    enqueue_tx: mpsc::Sender<Packet>,
    handle: JoinHandle<()>,
    dropped: Arc<AtomicI64>,
}

impl AsapHelper {
    /// starts a forwarder feeding `sink`; the helper exits when the sink is closed or the
    ///  helper is stopped
    pub fn new(sink: mpsc::Sender<Packet>) -> AsapHelper {
        let (enqueue_tx, mut enqueue_rx) = mpsc::channel::<Packet>(QUEUE_DEPTH);

        let handle = tokio::spawn(async move {
            while let Some(packet) = enqueue_rx.recv().await {
                if sink.send(packet).await.is_err() {
                    // consumer dropped its end
                    break;
                }
            }
        });

        AsapHelper {
            enqueue_tx,
            handle,
            dropped: Arc::new(AtomicI64::new(0)),
        }
    }

    /// offers one packet with a bounded wait; drops it if the queue stays full
    pub async fn offer(&self, packet: Packet) {
        if self.enqueue_tx.send_timeout(packet, ENQUEUE_WAIT).await.is_err() {
            trace!("asap queue full - dropping packet");
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> i64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// deterministic shutdown: the forwarder drains its queue and exits
    pub async fn stop(self) {
        drop(self.enqueue_tx);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Seqno;

    fn packet(seq: Seqno) -> Packet {
        Packet {
            seq_num: seq,
            ..Packet::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwards_to_sink() {
        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let helper = AsapHelper::new(sink_tx);

        helper.offer(packet(0)).await;
        helper.offer(packet(1)).await;

        assert_eq!(sink_rx.recv().await.unwrap().seq_num, 0);
        assert_eq!(sink_rx.recv().await.unwrap().seq_num, 1);
        assert_eq!(helper.dropped_count(), 0);

        helper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_when_consumer_stalls() {
        let (sink_tx, sink_rx) = mpsc::channel(1);
        let helper = AsapHelper::new(sink_tx);

        // nobody reads the sink: 1 slot in flight at the forwarder, 1 in the sink,
        //  QUEUE_DEPTH in the queue - everything beyond that must be dropped
        for seq in 0..(QUEUE_DEPTH as Seqno + 10) {
            helper.offer(packet(seq)).await;
        }

        assert!(helper.dropped_count() > 0);

        drop(sink_rx);
        helper.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drains_pending() {
        let (sink_tx, mut sink_rx) = mpsc::channel(QUEUE_DEPTH + 1);
        let helper = AsapHelper::new(sink_tx);

        for seq in 0..4 {
            helper.offer(packet(seq)).await;
        }
        helper.stop().await;

        let mut seen = Vec::new();
        while let Some(p) = sink_rx.recv().await {
            seen.push(p.seq_num);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }
}
