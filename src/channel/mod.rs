//! Per-channel send/receive state.
//!
//! A connection holds one [`Channel`] per configured [`ChannelKind`]; the position
//!  in that list is the wire-level channel id and is stable for the connection's
//!  lifetime. The five disciplines share two cores (reliable / unreliable) and
//!  differ only in their delivery policy.

mod reliable;
mod unreliable;

pub use reliable::{ReliableOrderedChannel, ReliableSequencedChannel, ReliableUnorderedChannel};
pub use unreliable::{UnreliableSequencedChannel, UnreliableUnorderedChannel};

use crate::config::ChannelKind;
use crate::retry_queue::{ResendTarget, RetryEntry, RetryQueue};
use crate::seq::SequenceId;
use crate::wire::{DataAckHeader, DataHeader};
use std::sync::Weak;
use std::time::Duration;

/// What a received DATA fragment resulted in: zero or more complete messages to
///  deliver, at most one ACK to send, and possibly a protocol violation.
#[derive(Default)]
pub struct ReceiveOutcome {
    pub deliveries: Vec<Vec<u8>>,
    pub ack: Option<DataAckHeader>,
    pub violation: bool,
}

impl ReceiveOutcome {
    pub(crate) fn violation() -> ReceiveOutcome {
        ReceiveOutcome {
            violation: true,
            ..Default::default()
        }
    }
}

/// Result of handling an incoming DATA_ACK.
#[derive(Debug, Eq, PartialEq)]
pub enum AckDisposition {
    Handled,
    /// An ACK on an unreliable channel; the sender is broken or malicious.
    ProtocolViolation,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct ChannelStats {
    /// packets waiting in the retry queue for an acknowledgement
    pub outgoing_queue_len: usize,
    /// incoming messages currently being reassembled
    pub pending_assemblies: usize,
}

pub enum Channel {
    UnreliableUnordered(UnreliableUnorderedChannel),
    UnreliableSequenced(UnreliableSequencedChannel),
    ReliableOrdered(ReliableOrderedChannel),
    ReliableUnordered(ReliableUnorderedChannel),
    ReliableSequenced(ReliableSequencedChannel),
}

impl Channel {
    pub fn new(
        kind: ChannelKind,
        retry_interval: Duration,
        owner: Weak<dyn ResendTarget>,
    ) -> Channel {
        match kind {
            ChannelKind::UnreliableUnordered => {
                Channel::UnreliableUnordered(UnreliableUnorderedChannel::new())
            }
            ChannelKind::UnreliableSequenced => {
                Channel::UnreliableSequenced(UnreliableSequencedChannel::new())
            }
            ChannelKind::ReliableOrdered => Channel::ReliableOrdered(ReliableOrderedChannel::new(
                RetryQueue::new(retry_interval, owner),
            )),
            ChannelKind::ReliableUnordered => Channel::ReliableUnordered(
                ReliableUnorderedChannel::new(RetryQueue::new(retry_interval, owner)),
            ),
            ChannelKind::ReliableSequenced => Channel::ReliableSequenced(
                ReliableSequencedChannel::new(RetryQueue::new(retry_interval, owner)),
            ),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self {
            Channel::UnreliableUnordered(_) => ChannelKind::UnreliableUnordered,
            Channel::UnreliableSequenced(_) => ChannelKind::UnreliableSequenced,
            Channel::ReliableOrdered(_) => ChannelKind::ReliableOrdered,
            Channel::ReliableUnordered(_) => ChannelKind::ReliableUnordered,
            Channel::ReliableSequenced(_) => ChannelKind::ReliableSequenced,
        }
    }

    /// Assigns the sequence id for a new outgoing message. On a reliable sequenced
    ///  channel this also drops superseded entries from the retry queue.
    pub fn begin_message(&mut self) -> SequenceId {
        match self {
            Channel::UnreliableUnordered(ch) => ch.next_sequence_id(),
            Channel::UnreliableSequenced(ch) => ch.next_sequence_id(),
            Channel::ReliableOrdered(ch) => ch.next_sequence_id(),
            Channel::ReliableUnordered(ch) => ch.next_sequence_id(),
            Channel::ReliableSequenced(ch) => ch.begin_superseding_message(),
        }
    }

    /// Hands an emitted fragment to the channel for retransmission tracking.
    ///  Unreliable kinds retain nothing.
    pub fn register_outgoing(&self, entry: RetryEntry) {
        match self {
            Channel::UnreliableUnordered(_) | Channel::UnreliableSequenced(_) => {}
            Channel::ReliableOrdered(ch) => ch.register_outgoing(entry),
            Channel::ReliableUnordered(ch) => ch.register_outgoing(entry),
            Channel::ReliableSequenced(ch) => ch.register_outgoing(entry),
        }
    }

    pub fn receive(&mut self, header: &DataHeader, payload: &[u8]) -> ReceiveOutcome {
        match self {
            Channel::UnreliableUnordered(ch) => ch.receive(header, payload),
            Channel::UnreliableSequenced(ch) => ch.receive(header, payload),
            Channel::ReliableOrdered(ch) => ch.receive(header, payload),
            Channel::ReliableUnordered(ch) => ch.receive(header, payload),
            Channel::ReliableSequenced(ch) => ch.receive(header, payload),
        }
    }

    pub fn receive_ack(&mut self, header: &DataAckHeader) -> AckDisposition {
        match self {
            Channel::UnreliableUnordered(_) | Channel::UnreliableSequenced(_) => {
                AckDisposition::ProtocolViolation
            }
            Channel::ReliableOrdered(ch) => {
                ch.receive_ack(header);
                AckDisposition::Handled
            }
            Channel::ReliableUnordered(ch) => {
                ch.receive_ack(header);
                AckDisposition::Handled
            }
            Channel::ReliableSequenced(ch) => {
                ch.receive_ack(header);
                AckDisposition::Handled
            }
        }
    }

    pub fn stats(&self) -> ChannelStats {
        match self {
            Channel::UnreliableUnordered(ch) => ch.stats(),
            Channel::UnreliableSequenced(ch) => ch.stats(),
            Channel::ReliableOrdered(ch) => ch.stats(),
            Channel::ReliableUnordered(ch) => ch.stats(),
            Channel::ReliableSequenced(ch) => ch.stats(),
        }
    }
}
