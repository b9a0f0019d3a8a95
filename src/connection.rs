//! Per-peer connection state: the handshake state machine, the per-channel
//!  send/receive states, and the disconnect paths.
//!
//! A connection is always held as `Arc<Connection>`; background work (handshake
//!  resends, retry timers) keeps only `Weak` references, so a late timer firing
//!  after teardown upgrades to nothing and exits.

use crate::buffers::pool::SharedBuffer;
use crate::channel::{AckDisposition, Channel, ChannelStats};
use crate::config::FRAGMENT_PAYLOAD;
use crate::context::ContextShared;
use crate::event::Event;
use crate::packet_stream::PacketStream;
use crate::retry_queue::{ResendTarget, RetryEntry};
use crate::wire::{ConnectAckHeader, ConnectOkHeader, DataAckHeader, DataHeader, PacketType};
use async_trait::async_trait;
use bytes::BufMut;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rand::Rng;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    /// Default state, connection is unavailable.
    Inactive,
    /// Client side: CONNECT has been sent, awaiting CONNECT_OK.
    Connecting,
    /// Server side: CONNECT_OK has been sent, awaiting CONNECT_ACK or DATA.
    Pending,
    /// Fully established and acknowledged.
    Established,
    /// Ended. Pending removal.
    Disconnected,
}

/// Aggregated diagnostic counters over all channels of a connection.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    /// packets waiting in retry queues for an acknowledgement
    pub outgoing_queue_len: usize,
    /// incoming messages currently being reassembled
    pub pending_assemblies: usize,
}

struct ConnectionInner {
    channels: Vec<Channel>,
}

pub struct Connection {
    shared: Arc<ContextShared>,
    self_weak: Weak<Connection>,
    endpoint: SocketAddr,
    connection_id: u16,
    state: AtomicU8,
    handshake: Mutex<Option<JoinHandle<()>>>,
    inner: RwLock<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(shared: Arc<ContextShared>, endpoint: SocketAddr) -> Arc<Connection> {
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let owner: Weak<dyn ResendTarget> = weak.clone();

            let channels = shared
                .config
                .channels
                .iter()
                .map(|&kind| Channel::new(kind, shared.config.retry_interval, owner.clone()))
                .collect();

            let connection_id = rand::thread_rng().gen();
            trace!("connection {} to {:?} constructed", connection_id, endpoint);

            Connection {
                shared,
                self_weak: weak.clone(),
                endpoint,
                connection_id,
                state: AtomicU8::new(ConnectionState::Inactive.into()),
                handshake: Mutex::new(None),
                inner: RwLock::new(ConnectionInner { channels }),
            }
        })
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn connection_id(&self) -> u16 {
        self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .expect("state byte is only ever written from ConnectionState values")
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.into(), Ordering::Release);
    }

    /// Atomically moves to DISCONNECTED; true iff this call made the transition.
    fn begin_disconnect(&self) -> bool {
        let prev = self
            .state
            .swap(ConnectionState::Disconnected.into(), Ordering::AcqRel);
        prev != u8::from(ConnectionState::Disconnected)
    }

    fn arc(&self) -> Option<Arc<Connection>> {
        self.self_weak.upgrade()
    }

    pub async fn stats(&self) -> ConnectionStats {
        let inner = self.inner.read().await;
        inner
            .channels
            .iter()
            .map(|ch| ch.stats())
            .fold(ConnectionStats::default(), |acc, s| ConnectionStats {
                outgoing_queue_len: acc.outgoing_queue_len + s.outgoing_queue_len,
                pending_assemblies: acc.pending_assemblies + s.pending_assemblies,
            })
    }

    pub async fn channel_stats(&self, channel_id: usize) -> Option<ChannelStats> {
        let inner = self.inner.read().await;
        inner.channels.get(channel_id).map(|ch| ch.stats())
    }

    // ---- handshake, client side ---------------------------------------------

    /// First phase of the handshake: INACTIVE -> CONNECTING, emit CONNECT and keep
    ///  re-emitting it until CONNECT_OK cancels the handshake.
    pub(crate) async fn send_connect(&self) {
        debug_assert_eq!(self.state(), ConnectionState::Inactive);

        debug!(
            "connection {}: starting handshake, now CONNECTING",
            self.connection_id
        );
        self.set_state(ConnectionState::Connecting);

        let mut buf = self.shared.pool.acquire();
        buf.put_u8(PacketType::Connect.into());
        let packet = buf.share();

        self.send_raw(&packet).await;
        self.start_handshake_timer(packet, ConnectionState::Connecting);
    }

    /// Second phase, client side: first CONNECT_OK establishes; every CONNECT_OK is
    ///  answered with CONNECT_ACK echoing the peer's connection id, because the
    ///  server keeps resending CONNECT_OK until one of our acks gets through.
    pub(crate) async fn receive_connect_ok(&self, header: ConnectOkHeader) {
        debug!(
            "connection {}: received CONNECT_OK (peer connection id {})",
            self.connection_id, header.connection_id
        );

        if self.state() == ConnectionState::Connecting {
            debug!("connection {}: ESTABLISHED", self.connection_id);
            self.cancel_handshake();
            self.set_state(ConnectionState::Established);
            self.push_connected_event();
        }

        let mut buf = self.shared.pool.acquire();
        ConnectAckHeader {
            connection_id: header.connection_id,
        }
        .ser(&mut buf);
        let packet = buf.share();
        self.send_raw(&packet).await;
    }

    // ---- handshake, server side ---------------------------------------------

    /// Server-side counterpart to `send_connect`: INACTIVE -> PENDING, emit
    ///  CONNECT_OK until CONNECT_ACK or DATA arrives. Called again while PENDING
    ///  (the peer is retrying its CONNECT) it re-emits immediately and restarts
    ///  the timer.
    pub(crate) async fn send_connect_ok(&self) {
        let mut buf = self.shared.pool.acquire();
        ConnectOkHeader {
            connection_id: self.connection_id,
        }
        .ser(&mut buf);
        let packet = buf.share();

        match self.state() {
            ConnectionState::Inactive => {
                debug!(
                    "connection {}: starting server handshake, now PENDING",
                    self.connection_id
                );
                self.set_state(ConnectionState::Pending);
            }
            ConnectionState::Pending => {
                debug!(
                    "connection {}: peer retried CONNECT, re-emitting CONNECT_OK",
                    self.connection_id
                );
            }
            other => {
                debug!(
                    "connection {}: not sending CONNECT_OK in state {:?}",
                    self.connection_id, other
                );
                return;
            }
        }

        self.send_raw(&packet).await;
        self.start_handshake_timer(packet, ConnectionState::Pending);
    }

    /// Final phase, server side: CONNECT_ACK while PENDING establishes.
    pub(crate) fn receive_connect_ack(&self, header: ConnectAckHeader) {
        if self.state() == ConnectionState::Pending {
            debug!(
                "connection {}: received CONNECT_ACK (echoed id {}), ESTABLISHED",
                self.connection_id, header.connection_id
            );
            self.cancel_handshake();
            self.set_state(ConnectionState::Established);
            self.push_connected_event();
        } else {
            debug!(
                "connection {}: CONNECT_ACK in state {:?}, ignoring",
                self.connection_id,
                self.state()
            );
        }
    }

    /// Shortcut establish: a valid DATA while PENDING acts as an implicit
    ///  CONNECT_ACK. The caller must have validated the DATA header before this.
    pub(crate) fn establish_from_data(&self) {
        if self.state() == ConnectionState::Pending {
            debug!(
                "connection {}: DATA completed the handshake, ESTABLISHED",
                self.connection_id
            );
            self.cancel_handshake();
            self.set_state(ConnectionState::Established);
            self.push_connected_event();
        }
    }

    fn start_handshake_timer(&self, packet: SharedBuffer, during: ConnectionState) {
        let weak = self.self_weak.clone();
        let interval = self.shared.config.handshake_interval;

        let handle = tokio::spawn(async move {
            loop {
                time::sleep(interval).await;

                let Some(conn) = weak.upgrade() else {
                    return;
                };
                if conn.state() != during {
                    return;
                }

                debug!(
                    "connection {}: handshake timeout, resending",
                    conn.connection_id
                );
                conn.send_raw(&packet).await;
            }
        });

        let mut slot = self.handshake.lock().expect("handshake slot lock poisoned");
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn cancel_handshake(&self) {
        let mut slot = self.handshake.lock().expect("handshake slot lock poisoned");
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn push_connected_event(&self) {
        if let Some(conn) = self.arc() {
            self.shared.events.push(Event::Connected { conn });
        }
    }

    // ---- data path ----------------------------------------------------------

    /// Sends one message on the given channel. The writer callback receives a byte
    ///  sink (`std::io::Write + Seek`); the message is flushed to the channel when
    ///  the callback returns.
    pub async fn send<F>(&self, channel_id: usize, write: F) -> anyhow::Result<()>
    where
        F: FnOnce(&mut PacketStream) -> io::Result<()>,
    {
        anyhow::ensure!(
            channel_id < self.shared.config.channels.len(),
            "channel index {} out of range (have {})",
            channel_id,
            self.shared.config.channels.len()
        );
        anyhow::ensure!(
            self.state() != ConnectionState::Disconnected,
            "connection to {:?} is disconnected",
            self.endpoint
        );

        let mut stream = PacketStream::new(self.shared.pool.clone());
        write(&mut stream)?;
        let (fragments, last_len) = stream.finish();

        self.send_data(channel_id, fragments, last_len).await;
        Ok(())
    }

    async fn send_data(
        &self,
        channel_id: usize,
        fragments: Vec<crate::buffers::pool::PooledBuf>,
        last_len: usize,
    ) {
        let fragment_count = fragments.len() as u8;

        // sid assignment order is emission order: the lock is held across the sends
        let mut inner = self.inner.write().await;
        let sequence_id = inner.channels[channel_id].begin_message();

        trace!(
            "connection {}: sending message {} on channel {} as {} fragment(s)",
            self.connection_id,
            sequence_id,
            channel_id,
            fragment_count
        );

        let last_index = fragments.len() - 1;
        for (fragment_id, mut buf) in fragments.into_iter().enumerate() {
            let header = DataHeader {
                sequence_id,
                channel_id: channel_id as u8,
                fragment_count,
                fragment_id: fragment_id as u8,
            };

            let wire_len = if fragment_id == last_index {
                crate::wire::DATA_HEADER_BYTES + last_len
            } else {
                crate::config::DATAGRAM_SIZE
            };

            header.stamp(buf.as_mut());
            buf.truncate(wire_len);
            let datagram = buf.share();

            inner.channels[channel_id].register_outgoing(RetryEntry {
                header,
                datagram: datagram.clone(),
            });

            self.send_raw(&datagram).await;
        }
    }

    /// Routes a validated DATA fragment into its channel, surfacing completed
    ///  messages as events and answering with an ACK where the discipline says so.
    pub(crate) async fn handle_data(&self, header: DataHeader, payload: &[u8]) {
        let outcome = {
            let mut inner = self.inner.write().await;
            inner.channels[header.channel_id as usize].receive(&header, payload)
        };

        if outcome.violation {
            warn!(
                "connection {}: malformed DATA on channel {} (sid {}), disconnecting",
                self.connection_id, header.channel_id, header.sequence_id
            );
            self.disconnect().await;
            return;
        }

        if let Some(conn) = self.arc() {
            for payload in outcome.deliveries {
                self.shared.events.push(Event::Received {
                    conn: conn.clone(),
                    channel_id: header.channel_id,
                    payload,
                });
            }
        }

        if let Some(ack) = outcome.ack {
            self.send_ack(ack).await;
        }
    }

    pub(crate) async fn handle_data_ack(&self, header: DataAckHeader) {
        let disposition = {
            let mut inner = self.inner.write().await;
            inner.channels[header.channel_id as usize].receive_ack(&header)
        };

        if disposition == AckDisposition::ProtocolViolation {
            warn!(
                "connection {}: DATA_ACK on unreliable channel {}, disconnecting",
                self.connection_id, header.channel_id
            );
            self.disconnect().await;
        }
    }

    async fn send_ack(&self, ack: DataAckHeader) {
        trace!(
            "connection {}: sending DATA_ACK (cid:{},sid:{},fid:{},expected:{})",
            self.connection_id,
            ack.channel_id,
            ack.sequence_id,
            ack.fragment_id,
            ack.expected_sequence_id
        );

        let mut buf = self.shared.pool.acquire();
        ack.ser(&mut buf);
        let packet = buf.share();
        self.send_raw(&packet).await;
    }

    /// Checks a DATA/DATA_ACK header against the channel configuration and the
    ///  fragment bounds. A false result is a protocol violation.
    pub(crate) fn is_valid_data_header(&self, header: &DataHeader, payload_len: usize) -> bool {
        (header.channel_id as usize) < self.shared.config.channels.len()
            && header.fragment_count >= 1
            && header.fragment_id < header.fragment_count
            && payload_len <= FRAGMENT_PAYLOAD
    }

    // ---- teardown -----------------------------------------------------------

    /// Graceful disconnect: emits DISCONNECT once (best-effort), surfaces a
    ///  disconnect event without an error, and removes the connection from its
    ///  context. Idempotent.
    pub async fn disconnect(&self) {
        if !self.begin_disconnect() {
            trace!("connection {}: already disconnected", self.connection_id);
            return;
        }

        debug!("connection {}: disconnecting", self.connection_id);
        self.cancel_handshake();

        let mut buf = self.shared.pool.acquire();
        buf.put_u8(PacketType::Disconnect.into());
        let packet = buf.share();
        if let Err(e) = self
            .shared
            .pipeline
            .send_packet(self.endpoint, &packet)
            .await
        {
            debug!(
                "connection {}: could not send DISCONNECT: {}",
                self.connection_id, e
            );
        }

        self.finish_teardown(None);
    }

    /// Disconnects without sending anything; used for fatal I/O errors and for a
    ///  received DISCONNECT. The peer (if alive) is left to its own timeout.
    pub(crate) fn disconnect_without_send(&self, error: Option<io::Error>) {
        if !self.begin_disconnect() {
            trace!("connection {}: already disconnected", self.connection_id);
            return;
        }

        debug!(
            "connection {}: disconnecting without send (error: {:?})",
            self.connection_id, error
        );
        self.cancel_handshake();
        self.finish_teardown(error);
    }

    fn finish_teardown(&self, error: Option<io::Error>) {
        if let Some(conn) = self.arc() {
            self.shared.events.push(Event::Disconnected { conn, error });
        }
        self.shared.unregister(self.endpoint);
    }

    /// Sends a raw datagram to the peer unless the connection is already gone. A
    ///  failed send force-disconnects with the OS error.
    pub(crate) async fn send_raw(&self, packet: &[u8]) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }

        trace!(
            "connection {}: sending {} bytes to {:?}",
            self.connection_id,
            packet.len(),
            self.endpoint
        );

        if let Err(e) = self
            .shared
            .pipeline
            .send_packet(self.endpoint, packet)
            .await
        {
            if self.shared.is_running() {
                error!(
                    "connection {}: send to {:?} failed: {}",
                    self.connection_id, self.endpoint, e
                );
                self.disconnect_without_send(Some(e));
            }
        }
    }
}

#[async_trait]
impl ResendTarget for Connection {
    async fn resend(&self, entry: &RetryEntry) {
        trace!(
            "connection {}: resending (sid:{},fid:{})",
            self.connection_id,
            entry.header.sequence_id,
            entry.header.fragment_id
        );
        self.send_raw(&entry.datagram).await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel_handshake();
    }
}
