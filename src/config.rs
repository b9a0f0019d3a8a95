use anyhow::bail;
use std::time::Duration;

/// The fixed size of a datagram on the wire. Every pooled buffer has exactly this
///  capacity, and no packet ever exceeds it.
///
/// The value is chosen to stay comfortably below common path MTUs so that the
///  protocol never relies on IP-level fragmentation. Choosing it bigger risks
///  silent drops on constrained routes; choosing it smaller wastes bandwidth on
///  header overhead.
pub const DATAGRAM_SIZE: usize = 1200;

/// Maximum number of fragments a single message may be split into.
pub const MAX_FRAGMENTS: usize = 256;

/// Number of reassembly slots in the fixed ring used by unreliable channels.
pub const ASSEMBLER_SLOTS: usize = 256;

/// Payload capacity of a single DATA fragment.
pub const FRAGMENT_PAYLOAD: usize = DATAGRAM_SIZE - crate::wire::DATA_HEADER_BYTES;

/// Upper bound for the length of a single application message. The wire format
///  encodes the fragment count in one byte, so at most 255 fragments are
///  addressable per message.
pub const MAX_MESSAGE_SIZE: usize = (MAX_FRAGMENTS - 1) * FRAGMENT_PAYLOAD;

/// The delivery discipline of a channel. A connection carries one channel state per
///  configured kind; the index into [`Config::channels`] is the wire-level channel id.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelKind {
    /// No acknowledgement, no ordering: messages arrive zero or more times, in any order.
    UnreliableUnordered,
    /// No acknowledgement; stale messages are dropped so delivered sequence ids only increase.
    UnreliableSequenced,
    /// Acknowledged and retransmitted; delivered strictly in send order without gaps.
    ReliableOrdered,
    /// Acknowledged and retransmitted; delivered exactly once, in completion order.
    ReliableUnordered,
    /// Acknowledged and retransmitted; newer messages supersede older unacknowledged ones.
    ReliableSequenced,
}

impl ChannelKind {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            ChannelKind::ReliableOrdered
                | ChannelKind::ReliableUnordered
                | ChannelKind::ReliableSequenced
        )
    }
}

/// Static configuration of a context. The channel list must be identical on both
///  peers - the wire format carries only the channel index, not its kind.
#[derive(Debug, Clone)]
pub struct Config {
    /// The channels available on every connection of this context, in wire order.
    pub channels: Vec<ChannelKind>,

    /// Interval after which an unacknowledged reliable fragment is resent.
    pub retry_interval: Duration,

    /// Interval after which an unanswered CONNECT / CONNECT_OK is resent. There is
    ///  no absolute handshake deadline; breaking a dead handshake is left to the
    ///  application.
    pub handshake_interval: Duration,
}

impl Config {
    pub fn new(channels: Vec<ChannelKind>) -> Config {
        Config {
            channels,
            retry_interval: Duration::from_millis(50),
            handshake_interval: Duration::from_millis(200),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channels.is_empty() {
            bail!("at least one channel must be configured");
        }
        if self.channels.len() > 256 {
            bail!("at most 256 channels can be addressed by the wire format");
        }
        if self.retry_interval.is_zero() || self.handshake_interval.is_zero() {
            bail!("retry and handshake intervals must be non-zero");
        }
        Ok(())
    }
}
