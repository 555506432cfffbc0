//! Advertised-window state coupling the receiver to the sender.
//!
//! The receiver recomputes its free capacity on every receive and every consumer delivery
//!  (mirroring TCP's `advertisedWindow = maxRecvBuffer - (lastByteRcvd - nextByteRead)`,
//!  in both bytes and messages) and publishes it here; the sender stamps the *local* snapshot
//!  onto every outbound packet and throttles new data against the *remote* snapshot.
//!
//! Updates are atomic snapshots: a reader sees either all fields from one update or all from
//!  another, never a mix.

use std::sync::Mutex;

/// One advertised-window snapshot: a receiver's currently free capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Flow {
    pub avail_reader_msg_cap: i64,
    pub avail_reader_bytes_cap: i64,
}

/// Shared advertised-window state, updated from both directions.
///
/// `local` is written by the receiver task of this session and read by the sender task when
///  stamping outbound packets. `remote` is written by the sender task from every arriving
///  packet's piggy-backed capacities and consulted before transmitting new data.
pub struct FlowControl {
    local: Mutex<Flow>,
    remote: Mutex<Flow>,
}

impl FlowControl {
    pub fn new(initial_local: Flow, initial_remote: Flow) -> FlowControl {
        FlowControl {
            local: Mutex::new(initial_local),
            remote: Mutex::new(initial_remote),
        }
    }

    pub fn update_local(&self, flow: Flow) {
        *self.local.lock().unwrap() = flow;
    }

    pub fn local(&self) -> Flow {
        *self.local.lock().unwrap()
    }

    /// Most recent values win - flow-control updates are applied in arrival order.
    pub fn update_remote(&self, flow: Flow) {
        *self.remote.lock().unwrap() = flow;
    }

    pub fn remote(&self) -> Flow {
        *self.remote.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(msg: i64, bytes: i64) -> Flow {
        Flow {
            avail_reader_msg_cap: msg,
            avail_reader_bytes_cap: bytes,
        }
    }

    #[test]
    fn test_snapshots_are_independent() {
        let fc = FlowControl::new(flow(10, 1000), flow(20, 2000));

        assert_eq!(fc.local(), flow(10, 1000));
        assert_eq!(fc.remote(), flow(20, 2000));

        fc.update_local(flow(3, 300));
        assert_eq!(fc.local(), flow(3, 300));
        assert_eq!(fc.remote(), flow(20, 2000));

        fc.update_remote(flow(0, 0));
        assert_eq!(fc.remote(), flow(0, 0));
        assert_eq!(fc.local(), flow(3, 300));
    }

    #[test]
    fn test_latest_update_wins() {
        let fc = FlowControl::new(flow(0, 0), flow(0, 0));
        fc.update_remote(flow(5, 500));
        fc.update_remote(flow(2, 200));
        assert_eq!(fc.remote(), flow(2, 200));
    }
}
