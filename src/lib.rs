//! A reliable, ordered, fragmenting message transport built over UDP.
//!
//! Applications get a set of independent logical *channels* over a single UDP
//!  socket; each channel offers one of five delivery disciplines. The library
//!  handles the connection handshake, fragmentation and reassembly of
//!  arbitrary-size messages, acknowledgement and retransmission, and clean
//!  disconnection.
//!
//! ## Channels
//!
//! | Kind | Retransmitted | Delivery guarantee |
//! |---|---|---|
//! | unreliable unordered | no | whatever arrives, in any order |
//! | unreliable sequenced | no | delivered sequence ids strictly increase |
//! | reliable ordered | yes | exactly once, in send order, no gaps |
//! | reliable unordered | yes | exactly once, in completion order |
//! | reliable sequenced | yes | strictly increasing; newer supersedes older |
//!
//! A message is fragmented into datagrams of at most 1200 bytes; fragments of
//!  one message share a sequence id and are reassembled on the receiving side.
//!  Sequence ids are 32-bit and wrap; all comparisons are performed with a
//!  wrap-aware circular ordering.
//!
//! ## Wire format
//!
//! All integers little-endian, written field by field. The first byte of every
//!  datagram is the packet type:
//!
//! ```ascii
//! 0 CONNECT      (no payload)
//! 1 CONNECT_OK   u16 connection_id
//! 2 CONNECT_ACK  u16 connection_id (echoed)
//! 3 DISCONNECT   (no payload)
//! 4 DATA         u32 sequence_id; u8 channel_id; u8 fragment_count;
//!                u8 fragment_id; u8 pad - then payload bytes
//! 5 DATA_ACK     u32 sequence_id; u32 expected_sequence_id; u8 channel_id;
//!                u8 fragment_id
//! ```
//!
//! ## Handshake
//!
//! Three-way: the client emits CONNECT (resent every 200 ms) until the server
//!  answers CONNECT_OK (also resent); the client acknowledges every CONNECT_OK
//!  with CONNECT_ACK. The server treats the first CONNECT_ACK *or* the first
//!  valid DATA as completion, so an eager sender saves one round trip.
//!
//! ## Usage
//!
//! ```no_run
//! use lattice::{ChannelKind, ClientContext, Config, ServerContext};
//! use std::io::Write;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::new(vec![ChannelKind::ReliableOrdered]);
//!
//! let server = ServerContext::listen(config.clone(), "127.0.0.1:0".parse()?).await?;
//! let client = ClientContext::connect(
//!     config,
//!     "127.0.0.1:0".parse()?,
//!     server.local_addr(),
//! ).await?;
//!
//! let conn = client.connection().expect("connecting");
//! conn.send(0, |msg| msg.write_all(b"hello")).await?;
//!
//! // ... poll_events() on another thread dispatches connect / receive /
//! //     disconnect events ...
//!
//! client.stop().await;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Each context runs one receive-loop task that owns the socket reads; all
//!  connection mutation is serialized behind per-connection locks. Background
//!  activity (handshake re-emission, retransmission timers) runs on spawned
//!  tasks that hold only weak references, so late firings after a teardown
//!  upgrade to nothing and vanish. The event queue hands completed work to the
//!  application thread, which never touches protocol state directly.
//!
//! Out of scope: congestion control, encryption, authentication, NAT
//!  traversal, multipath, flow control beyond retransmission pacing.

pub mod buffers;
pub mod channel;
pub mod config;
pub mod connection;
pub mod context;
pub mod event;
pub mod fragment;
pub mod packet_stream;
pub mod retry_queue;
pub mod send_pipeline;
pub mod seq;
pub mod wire;

pub use channel::ChannelStats;
pub use config::{ChannelKind, Config};
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use context::{ClientContext, ServerContext};
pub use event::{Event, EventHandler};
pub use packet_stream::PacketStream;
pub use seq::SequenceId;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
