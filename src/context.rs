//! Client and server contexts: the place where all other parts of the protocol
//!  come together. A context owns the UDP socket, runs the receive loop that
//!  classifies and routes incoming datagrams to connections, and hosts the event
//!  queue the application drains with `poll_events`.

use crate::buffers::pool::BufferPool;
use crate::config::{Config, DATAGRAM_SIZE};
use crate::connection::{Connection, ConnectionState};
use crate::event::{EventHandler, EventQueue};
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::wire::{ConnectAckHeader, ConnectOkHeader, DataAckHeader, DataHeader, PacketType};
use rand::Rng;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

/// State shared between a context, its connections and its receive loop.
pub(crate) struct ContextShared {
    pub(crate) config: Arc<Config>,
    pub(crate) context_id: u16,
    pub(crate) pipeline: SendPipeline,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) events: EventQueue,
    pub(crate) connections: Mutex<FxHashMap<SocketAddr, Arc<Connection>>>,
    pub(crate) running: AtomicBool,
}

impl ContextShared {
    pub(crate) fn new(config: Arc<Config>, socket: Arc<dyn SendSocket>) -> Arc<ContextShared> {
        Arc::new(ContextShared {
            config,
            context_id: rand::thread_rng().gen(),
            pipeline: SendPipeline::new(socket),
            pool: Arc::new(BufferPool::new()),
            events: EventQueue::new(),
            connections: Mutex::new(FxHashMap::default()),
            running: AtomicBool::new(true),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Removes a dead connection from the routing map; no datagram is routed to it
    ///  afterwards.
    pub(crate) fn unregister(&self, endpoint: SocketAddr) {
        self.connections
            .lock()
            .expect("connection map lock poisoned")
            .remove(&endpoint);
    }

    fn connection_for(&self, endpoint: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connection map lock poisoned")
            .get(endpoint)
            .cloned()
    }

    fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .expect("connection map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Leaves the running state and disconnects every live connection; each one
    ///  surfaces a final disconnect event.
    async fn stop_all(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for conn in self.live_connections() {
            conn.disconnect().await;
        }
    }
}

#[derive(Copy, Clone)]
enum Role {
    Client { server_addr: SocketAddr },
    Server,
}

async fn recv_loop(shared: Arc<ContextShared>, socket: Arc<UdpSocket>, role: Role) {
    info!(
        "starting receive loop on {:?}",
        UdpSocket::local_addr(&socket).ok()
    );

    let mut buf = vec![0u8; DATAGRAM_SIZE];
    while shared.is_running() {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                if !shared.is_running() {
                    break;
                }
                // transient receive failures don't stop the loop
                error!("socket receive error: {}", e);
                continue;
            }
        };

        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        trace!(parent: &span, "received {} bytes from {:?}", len, from);

        match role {
            Role::Client { server_addr } => {
                dispatch_client(&shared, server_addr, from, &buf[..len])
                    .instrument(span)
                    .await
            }
            Role::Server => {
                dispatch_server(&shared, from, &buf[..len])
                    .instrument(span)
                    .await
            }
        }
    }

    debug!("receive loop ended");
}

async fn dispatch_client(
    shared: &Arc<ContextShared>,
    server_addr: SocketAddr,
    from: SocketAddr,
    datagram: &[u8],
) {
    let Some(conn) = shared.connection_for(&server_addr) else {
        trace!("no live connection, dropping datagram");
        return;
    };

    if from != server_addr {
        debug!("datagram from unknown peer {:?}, ignoring", from);
        return;
    }

    let Some((&type_byte, rest)) = datagram.split_first() else {
        debug!("empty datagram from {:?}, ignoring", from);
        return;
    };
    let Ok(packet_type) = PacketType::try_from(type_byte) else {
        warn!(
            "unknown packet type {} from server, disconnecting",
            type_byte
        );
        conn.disconnect().await;
        return;
    };

    match packet_type {
        PacketType::Connect => {
            warn!("unexpected CONNECT from server, disconnecting");
            conn.disconnect().await;
        }
        PacketType::ConnectOk => {
            let mut parse = rest;
            match ConnectOkHeader::deser(&mut parse) {
                Ok(header) => conn.receive_connect_ok(header).await,
                Err(_) => {
                    warn!("unparsable CONNECT_OK, disconnecting");
                    conn.disconnect().await;
                }
            }
        }
        PacketType::ConnectAck => {
            warn!("unexpected CONNECT_ACK from server, disconnecting");
            conn.disconnect().await;
        }
        PacketType::Disconnect => {
            debug!("DISCONNECT from server");
            conn.disconnect_without_send(None);
        }
        PacketType::Data => {
            if conn.state() != ConnectionState::Established {
                warn!("DATA before the handshake completed, disconnecting");
                conn.disconnect().await;
                return;
            }

            let mut parse = rest;
            let Ok(header) = DataHeader::deser(&mut parse) else {
                warn!("unparsable DATA header, disconnecting");
                conn.disconnect().await;
                return;
            };
            if !conn.is_valid_data_header(&header, parse.len()) {
                warn!(
                    "invalid DATA header (cid:{},sid:{}), disconnecting",
                    header.channel_id, header.sequence_id
                );
                conn.disconnect().await;
                return;
            }

            conn.handle_data(header, parse).await;
        }
        PacketType::DataAck => {
            if conn.state() != ConnectionState::Established {
                warn!("DATA_ACK before the handshake completed, disconnecting");
                conn.disconnect().await;
                return;
            }

            let mut parse = rest;
            let Ok(header) = DataAckHeader::deser(&mut parse) else {
                warn!("unparsable DATA_ACK header, disconnecting");
                conn.disconnect().await;
                return;
            };
            if header.channel_id as usize >= shared.config.channels.len() {
                warn!(
                    "DATA_ACK with invalid channel id {}, disconnecting",
                    header.channel_id
                );
                conn.disconnect().await;
                return;
            }

            conn.handle_data_ack(header).await;
        }
    }
}

async fn dispatch_server(shared: &Arc<ContextShared>, from: SocketAddr, datagram: &[u8]) {
    let Some((&type_byte, rest)) = datagram.split_first() else {
        debug!("empty datagram from {:?}, ignoring", from);
        return;
    };

    let existing = shared.connection_for(&from);

    let Ok(packet_type) = PacketType::try_from(type_byte) else {
        warn!("unknown packet type {} from {:?}", type_byte, from);
        if let Some(conn) = existing {
            conn.disconnect().await;
        }
        return;
    };

    match packet_type {
        PacketType::Connect => {
            let conn = match existing {
                Some(conn) => conn,
                None => {
                    debug!("CONNECT from new peer {:?}", from);
                    let conn = Connection::new(shared.clone(), from);
                    shared
                        .connections
                        .lock()
                        .expect("connection map lock poisoned")
                        .insert(from, conn.clone());
                    conn
                }
            };

            match conn.state() {
                // a repeated CONNECT while PENDING re-solicits immediately
                ConnectionState::Inactive | ConnectionState::Pending => {
                    conn.send_connect_ok().await
                }
                other => debug!("CONNECT for connection in state {:?}, ignoring", other),
            }
        }
        PacketType::ConnectOk => match existing {
            Some(conn) => {
                warn!(
                    "unexpected CONNECT_OK from client {:?}, disconnecting",
                    from
                );
                conn.disconnect().await;
            }
            None => debug!("CONNECT_OK from unknown peer {:?}, ignoring", from),
        },
        PacketType::ConnectAck => match existing {
            Some(conn) => {
                let mut parse = rest;
                match ConnectAckHeader::deser(&mut parse) {
                    Ok(header) => conn.receive_connect_ack(header),
                    Err(_) => {
                        warn!("unparsable CONNECT_ACK from {:?}, disconnecting", from);
                        conn.disconnect().await;
                    }
                }
            }
            None => debug!("CONNECT_ACK from unknown peer {:?}, ignoring", from),
        },
        PacketType::Disconnect => match existing {
            Some(conn) => {
                debug!("DISCONNECT from {:?}", from);
                conn.disconnect_without_send(None);
            }
            None => debug!("DISCONNECT from unknown peer {:?}, ignoring", from),
        },
        PacketType::Data => {
            let Some(conn) = existing else {
                debug!("DATA from unknown peer {:?}, ignoring", from);
                return;
            };

            match conn.state() {
                ConnectionState::Pending | ConnectionState::Established => {
                    let mut parse = rest;
                    let Ok(header) = DataHeader::deser(&mut parse) else {
                        warn!("unparsable DATA header from {:?}, disconnecting", from);
                        conn.disconnect().await;
                        return;
                    };
                    if !conn.is_valid_data_header(&header, parse.len()) {
                        warn!(
                            "invalid DATA header from {:?} (cid:{},sid:{}), disconnecting",
                            from, header.channel_id, header.sequence_id
                        );
                        conn.disconnect().await;
                        return;
                    }

                    // a valid DATA acts as an implicit CONNECT_ACK
                    conn.establish_from_data();
                    conn.handle_data(header, parse).await;
                }
                _ => {
                    warn!("DATA from {:?} before the handshake, disconnecting", from);
                    conn.disconnect().await;
                }
            }
        }
        PacketType::DataAck => {
            let Some(conn) = existing else {
                debug!("DATA_ACK from unknown peer {:?}, ignoring", from);
                return;
            };
            if conn.state() != ConnectionState::Established {
                warn!(
                    "DATA_ACK from {:?} before the handshake completed, disconnecting",
                    from
                );
                conn.disconnect().await;
                return;
            }

            let mut parse = rest;
            let Ok(header) = DataAckHeader::deser(&mut parse) else {
                warn!("unparsable DATA_ACK header from {:?}, disconnecting", from);
                conn.disconnect().await;
                return;
            };
            if header.channel_id as usize >= shared.config.channels.len() {
                warn!(
                    "DATA_ACK with invalid channel id {} from {:?}, disconnecting",
                    header.channel_id, from
                );
                conn.disconnect().await;
                return;
            }

            conn.handle_data_ack(header).await;
        }
    }
}

/// A context with exactly one connection, to a server.
pub struct ClientContext {
    shared: Arc<ContextShared>,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientContext {
    /// Binds a UDP socket to `local_addr` and starts the handshake towards
    ///  `server_addr`. The connection surfaces a connect event once established.
    pub async fn connect(
        config: Config,
        local_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> anyhow::Result<ClientContext> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let local_addr = UdpSocket::local_addr(&socket)?;
        info!(
            "client socket bound to {:?}, connecting to {:?}",
            local_addr, server_addr
        );

        let shared = ContextShared::new(Arc::new(config), Arc::new(socket.clone()));

        let conn = Connection::new(shared.clone(), server_addr);
        shared
            .connections
            .lock()
            .expect("connection map lock poisoned")
            .insert(server_addr, conn.clone());
        conn.send_connect().await;

        let recv_task = tokio::spawn(recv_loop(
            shared.clone(),
            socket,
            Role::Client { server_addr },
        ));

        Ok(ClientContext {
            shared,
            server_addr,
            local_addr,
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    /// The connection to the server, while it is alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.shared.connection_for(&self.server_addr)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context_id(&self) -> u16 {
        self.shared.context_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Dispatches all queued events to the handler; meant to be called from the
    ///  application thread.
    pub fn poll_events(&self, handler: &mut dyn EventHandler) -> usize {
        self.shared.events.poll(handler)
    }

    /// Disconnects, surfaces the final disconnect event and shuts the socket down.
    ///  Idempotent.
    pub async fn stop(&self) {
        self.shared.stop_all().await;
        abort_recv_task(&self.recv_task);
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        abort_recv_task(&self.recv_task);
    }
}

/// A context accepting any number of client connections, keyed by peer endpoint.
pub struct ServerContext {
    shared: Arc<ContextShared>,
    local_addr: SocketAddr,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerContext {
    /// Binds a UDP socket to `local_addr` and starts accepting connections.
    pub async fn listen(config: Config, local_addr: SocketAddr) -> anyhow::Result<ServerContext> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let local_addr = UdpSocket::local_addr(&socket)?;
        info!("server socket bound to {:?}", local_addr);

        let shared = ContextShared::new(Arc::new(config), Arc::new(socket.clone()));
        let recv_task = tokio::spawn(recv_loop(shared.clone(), socket, Role::Server));

        Ok(ServerContext {
            shared,
            local_addr,
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context_id(&self) -> u16 {
        self.shared.context_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn connection_count(&self) -> usize {
        self.shared
            .connections
            .lock()
            .expect("connection map lock poisoned")
            .len()
    }

    /// Dispatches all queued events to the handler; meant to be called from the
    ///  application thread.
    pub fn poll_events(&self, handler: &mut dyn EventHandler) -> usize {
        self.shared.events.poll(handler)
    }

    /// Disconnects all clients, surfaces their final disconnect events and shuts
    ///  the socket down. Idempotent.
    pub async fn stop(&self) {
        self.shared.stop_all().await;
        abort_recv_task(&self.recv_task);
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        abort_recv_task(&self.recv_task);
    }
}

fn abort_recv_task(slot: &Mutex<Option<JoinHandle<()>>>) {
    let mut slot = slot.lock().expect("receive task slot lock poisoned");
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}
