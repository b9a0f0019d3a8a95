//! Shared scaffolding for the end-to-end tests: an event collector and a lossy
//!  UDP relay for exercising retransmission under packet loss.

use lattice::{Connection, EventHandler};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct Collector {
    pub connections: Vec<Arc<Connection>>,
    pub disconnect_errors: Vec<Option<std::io::ErrorKind>>,
    pub received: Vec<(u8, Vec<u8>)>,
}

impl EventHandler for Collector {
    fn on_connect(&mut self, conn: &Arc<Connection>) {
        self.connections.push(conn.clone());
    }

    fn on_disconnect(&mut self, _conn: &Arc<Connection>, error: Option<&std::io::Error>) {
        self.disconnect_errors.push(error.map(|e| e.kind()));
    }

    fn on_receive(&mut self, _conn: &Arc<Connection>, channel_id: u8, payload: &[u8]) {
        self.received.push((channel_id, payload.to_vec()));
    }
}

impl Collector {
    pub fn received_i32s(&self) -> Vec<i32> {
        self.received
            .iter()
            .map(|(_, payload)| i32::from_le_bytes(payload.as_slice().try_into().unwrap()))
            .collect()
    }

    pub fn assert_no_error_disconnects(&self) {
        assert!(
            self.disconnect_errors.iter().all(|e| e.is_none()),
            "unexpected error disconnects: {:?}",
            self.disconnect_errors
        );
    }
}

/// A relay that forwards datagrams between one client and a server, dropping a
///  configured fraction in each direction. The client is whoever sends first.
pub struct LossyRelay {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl LossyRelay {
    pub async fn start(server_addr: SocketAddr, drop_rate: f64, seed: u64) -> LossyRelay {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let task = tokio::spawn(Self::run(socket, server_addr, drop_rate, seed));
        LossyRelay { addr, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn run(socket: UdpSocket, server_addr: SocketAddr, drop_rate: f64, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut client_addr: Option<SocketAddr> = None;
        let mut buf = [0u8; 1500];

        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(_) => continue,
            };

            let to = if from == server_addr {
                match client_addr {
                    Some(addr) => addr,
                    None => continue,
                }
            } else {
                client_addr = Some(from);
                server_addr
            };

            if rng.gen::<f64>() < drop_rate {
                continue;
            }

            let _ = socket.send_to(&buf[..len], to).await;
        }
    }
}

impl Drop for LossyRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}
