//! A real substrate: packets over a UDP socket, with inbox-name routing.
//!
//! Each endpoint binds one socket that carries all of its sessions' traffic. Outbound
//!  routing maps a destination inbox name to a socket address; inbound packets are parsed
//!  and handed to whichever local inbox they name. UDP keeps exactly the send-and-pray
//!  contract the engine is built for - loss, reordering and duplication are all possible
//!  and all covered by the protocol above.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::net::Network;
use crate::packet::Packet;

type Listeners = Arc<Mutex<FxHashMap<String, mpsc::Sender<Packet>>>>;

pub struct UdpNet {
    socket: Arc<UdpSocket>,
    routes: Mutex<FxHashMap<String, SocketAddr>>,
    listeners: Listeners,
    recv_handle: JoinHandle<()>,
}

impl Drop for UdpNet {
    fn drop(&mut self) {
        self.recv_handle.abort();
    }
}

impl UdpNet {
    pub async fn bind(addrs: impl ToSocketAddrs) -> anyhow::Result<UdpNet> {
        let socket = Arc::new(UdpSocket::bind(addrs).await?);
        let listeners: Listeners = Default::default();

        let recv_handle = tokio::spawn(Self::recv_loop(socket.clone(), listeners.clone()));

        Ok(UdpNet {
            socket,
            routes: Mutex::new(FxHashMap::default()),
            listeners,
            recv_handle,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// registers the socket address behind a destination inbox name
    pub fn add_route(&self, inbox: impl Into<String>, addr: SocketAddr) {
        self.routes.lock().unwrap().insert(inbox.into(), addr);
    }

    async fn recv_loop(socket: Arc<UdpSocket>, listeners: Listeners) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (num_read, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let parse_buf = &mut &buf[..num_read];
            let packet = match Packet::deser(parse_buf) {
                Ok(packet) => packet,
                Err(_) => {
                    warn!("received packet with unparsable body from {:?}, dropping", from);
                    continue;
                }
            };

            let tx = listeners.lock().unwrap().get(&packet.dest).cloned();
            match tx {
                Some(tx) => {
                    // a full inbox queue means the endpoint is overwhelmed - drop, the
                    //  protocol recovers
                    let _ = tx.try_send(packet);
                }
                None => {
                    warn!("received packet for unknown inbox '{}' from {:?}, dropping", packet.dest, from);
                }
            }
        }
    }
}

#[async_trait]
impl Network for UdpNet {
    async fn send(&self, packet: Packet, _why: &'static str) -> anyhow::Result<()> {
        let addr = match self.routes.lock().unwrap().get(&packet.dest) {
            Some(addr) => *addr,
            None => bail!("no route for inbox '{}'", packet.dest),
        };

        let mut buf = BytesMut::new();
        packet.ser(&mut buf);

        self.socket.send_to(&buf, addr).await?;
        Ok(())
    }

    async fn listen(&self, inbox: &str) -> anyhow::Result<mpsc::Receiver<Packet>> {
        let (tx, rx) = mpsc::channel(64);
        self.listeners.lock().unwrap().insert(inbox.to_string(), tx);
        Ok(rx)
    }

    fn buffer_caps(&self) -> (i64, i64) {
        // UDP imposes no broker-style queue limits; report caps high enough that only the
        //  peer's advertised window throttles the sender
        (1024 * 1024 * 1024, 1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_roundtrip_between_two_sockets() {
        let a = UdpNet::bind("127.0.0.1:0").await.unwrap();
        let b = UdpNet::bind("127.0.0.1:0").await.unwrap();

        a.add_route("B", b.local_addr().unwrap());
        b.add_route("A", a.local_addr().unwrap());

        let mut b_inbox = b.listen("B").await.unwrap();

        let packet = Packet {
            seq_num: 7,
            data: Bytes::from_static(b"over the wire"),
            ..Packet::data("A", "B", Bytes::new())
        };
        a.send(packet.clone(), "test").await.unwrap();

        let arrived = b_inbox.recv().await.unwrap();
        assert_eq!(arrived, packet);
    }

    #[tokio::test]
    async fn test_send_without_route_fails() {
        let a = UdpNet::bind("127.0.0.1:0").await.unwrap();
        let result = a.send(Packet::data("A", "B", Bytes::new()), "test").await;
        assert!(result.is_err());
    }
}
