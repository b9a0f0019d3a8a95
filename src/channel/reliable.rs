//! The three reliable disciplines. They share a core that reassembles fragments
//!  per sequence id, suppresses duplicates, acks every fragment piece and drives
//!  the retry queue from incoming acks; they differ in when a completed message
//!  is released to the application.

use crate::channel::{ChannelStats, ReceiveOutcome};
use crate::fragment::FragmentAssembler;
use crate::retry_queue::{RetryEntry, RetryQueue};
use crate::seq::SequenceId;
use crate::wire::{DataAckHeader, DataHeader};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

pub(crate) struct ReliableCore {
    sequence_id: SequenceId,
    /// next sequence id to be delivered (ordered) resp. the contiguous reclaim mark
    incoming_sequence_id: SequenceId,
    /// greatest `expected_sequence_id` seen in an ACK so far
    last_expected_sequence_id: SequenceId,
    assemblers: FxHashMap<SequenceId, FragmentAssembler>,
    outgoing: RetryQueue,
}

enum Accepted {
    /// already delivered or already present; worth an ACK but nothing else
    Duplicate,
    /// stored, message not complete yet
    Stored,
    /// this fragment completed the message
    Completed,
    /// the fragment contradicts the assembler's geometry
    Mismatch,
}

impl ReliableCore {
    fn new(outgoing: RetryQueue) -> ReliableCore {
        ReliableCore {
            sequence_id: SequenceId::ZERO,
            incoming_sequence_id: SequenceId::ZERO,
            last_expected_sequence_id: SequenceId::ZERO,
            assemblers: FxHashMap::default(),
            outgoing,
        }
    }

    fn next_sequence_id(&mut self) -> SequenceId {
        let id = self.sequence_id;
        self.sequence_id = id.next();
        id
    }

    fn accept_fragment(&mut self, header: &DataHeader, payload: &[u8]) -> Accepted {
        if header.sequence_id.precedes(self.incoming_sequence_id) {
            trace!(
                "fragment {}/{} of message {} is a duplicate below the delivery mark {}",
                header.fragment_id,
                header.fragment_count,
                header.sequence_id,
                self.incoming_sequence_id
            );
            return Accepted::Duplicate;
        }

        let assembler = self
            .assemblers
            .entry(header.sequence_id)
            .or_insert_with(|| FragmentAssembler::new(header.sequence_id, header.fragment_count));

        if assembler.fragment_count() != header.fragment_count {
            warn!(
                "message {} announced {} fragments earlier but now {}",
                header.sequence_id,
                assembler.fragment_count(),
                header.fragment_count
            );
            return Accepted::Mismatch;
        }
        if assembler.has_fragment(header.fragment_id) {
            trace!(
                "fragment {} of message {} already present",
                header.fragment_id,
                header.sequence_id
            );
            return Accepted::Duplicate;
        }

        assembler.receive(header.fragment_id, payload);

        if assembler.is_complete() {
            Accepted::Completed
        } else {
            Accepted::Stored
        }
    }

    /// ACK policy: every fragment piece is acknowledged, deliberately redundantly,
    ///  with the receiver's current contiguous high-water mark.
    fn ack_for(&self, header: &DataHeader) -> DataAckHeader {
        DataAckHeader {
            sequence_id: header.sequence_id,
            expected_sequence_id: self.incoming_sequence_id,
            channel_id: header.channel_id,
            fragment_id: header.fragment_id,
        }
    }

    fn receive_ack(&mut self, header: &DataAckHeader) {
        let matched = if self
            .last_expected_sequence_id
            .precedes(header.expected_sequence_id)
        {
            // the peer's high-water mark advanced: everything below it is implicitly
            //  acknowledged, plus the specific fragment
            let expected = header.expected_sequence_id;
            let sid = header.sequence_id;
            let fid = header.fragment_id;
            let matched = self.outgoing.remove_all_if(|e| {
                e.header.sequence_id.precedes(expected)
                    || (e.header.sequence_id == sid && e.header.fragment_id == fid)
            });

            self.last_expected_sequence_id = header.expected_sequence_id;
            matched
        } else {
            self.outgoing.remove_one_if(|e| {
                e.header.sequence_id == header.sequence_id
                    && e.header.fragment_id == header.fragment_id
            })
        };

        if matched {
            trace!(
                "DATA_ACK (sid:{},fid:{}) matched outgoing packets",
                header.sequence_id,
                header.fragment_id
            );
        } else {
            debug!(
                "DATA_ACK (sid:{},fid:{}) did not correspond to any outgoing packet",
                header.sequence_id, header.fragment_id
            );
        }
    }

    fn register_outgoing(&self, entry: RetryEntry) {
        self.outgoing.push(entry);
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            outgoing_queue_len: self.outgoing.len(),
            pending_assemblies: self
                .assemblers
                .values()
                .filter(|a| !a.is_cancelled())
                .count(),
        }
    }
}

/// Reliable ordered: messages are released to the application strictly in
///  sequence id order, without gaps.
pub struct ReliableOrderedChannel {
    core: ReliableCore,
}

impl ReliableOrderedChannel {
    pub(crate) fn new(outgoing: RetryQueue) -> ReliableOrderedChannel {
        ReliableOrderedChannel {
            core: ReliableCore::new(outgoing),
        }
    }

    pub(crate) fn next_sequence_id(&mut self) -> SequenceId {
        self.core.next_sequence_id()
    }

    pub(crate) fn register_outgoing(&self, entry: RetryEntry) {
        self.core.register_outgoing(entry);
    }

    pub(crate) fn receive_ack(&mut self, header: &DataAckHeader) {
        self.core.receive_ack(header);
    }

    pub(crate) fn receive(&mut self, header: &DataHeader, payload: &[u8]) -> ReceiveOutcome {
        let mut deliveries = Vec::new();

        match self.core.accept_fragment(header, payload) {
            Accepted::Mismatch => return ReceiveOutcome::violation(),
            Accepted::Duplicate | Accepted::Stored => {}
            Accepted::Completed => {
                if header.sequence_id == self.core.incoming_sequence_id {
                    // release this message and every contiguous complete follower
                    while let Some(assembler) = self
                        .core
                        .assemblers
                        .get_mut(&self.core.incoming_sequence_id)
                    {
                        if !assembler.is_complete() {
                            break;
                        }
                        deliveries.push(assembler.release());

                        let sid = self.core.incoming_sequence_id;
                        self.core.assemblers.remove(&sid);
                        self.core.incoming_sequence_id = sid.next();
                    }
                }
            }
        }

        ReceiveOutcome {
            ack: Some(self.core.ack_for(header)),
            deliveries,
            violation: false,
        }
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        self.core.stats()
    }
}

/// Reliable unordered: every message is released as soon as it completes;
///  consumed assemblers stay behind (cancelled) to suppress duplicates until the
///  contiguous prefix can be reclaimed.
pub struct ReliableUnorderedChannel {
    core: ReliableCore,
}

impl ReliableUnorderedChannel {
    pub(crate) fn new(outgoing: RetryQueue) -> ReliableUnorderedChannel {
        ReliableUnorderedChannel {
            core: ReliableCore::new(outgoing),
        }
    }

    pub(crate) fn next_sequence_id(&mut self) -> SequenceId {
        self.core.next_sequence_id()
    }

    pub(crate) fn register_outgoing(&self, entry: RetryEntry) {
        self.core.register_outgoing(entry);
    }

    pub(crate) fn receive_ack(&mut self, header: &DataAckHeader) {
        self.core.receive_ack(header);
    }

    pub(crate) fn receive(&mut self, header: &DataHeader, payload: &[u8]) -> ReceiveOutcome {
        let mut deliveries = Vec::new();

        match self.core.accept_fragment(header, payload) {
            Accepted::Mismatch => return ReceiveOutcome::violation(),
            Accepted::Duplicate | Accepted::Stored => {}
            Accepted::Completed => {
                let assembler = self
                    .core
                    .assemblers
                    .get_mut(&header.sequence_id)
                    .expect("assembler exists: it just completed");
                deliveries.push(assembler.release());

                if header.sequence_id == self.core.incoming_sequence_id {
                    // reclaim the contiguous prefix of consumed assemblers
                    while let Some(assembler) =
                        self.core.assemblers.get(&self.core.incoming_sequence_id)
                    {
                        if !assembler.is_complete() {
                            break;
                        }
                        let sid = self.core.incoming_sequence_id;
                        self.core.assemblers.remove(&sid);
                        self.core.incoming_sequence_id = sid.next();
                    }
                }
            }
        }

        ReceiveOutcome {
            ack: Some(self.core.ack_for(header)),
            deliveries,
            violation: false,
        }
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        self.core.stats()
    }
}

/// Reliable sequenced: a newly sent message supersedes older unacknowledged ones,
///  and a delivered message discards all older in-flight reassemblies.
pub struct ReliableSequencedChannel {
    core: ReliableCore,
}

impl ReliableSequencedChannel {
    pub(crate) fn new(outgoing: RetryQueue) -> ReliableSequencedChannel {
        ReliableSequencedChannel {
            core: ReliableCore::new(outgoing),
        }
    }

    /// Assigns the next outgoing id and drops retry entries for all older messages.
    pub(crate) fn begin_superseding_message(&mut self) -> SequenceId {
        let sid = self.core.next_sequence_id();
        self.core
            .outgoing
            .remove_all_if(|e| e.header.sequence_id.precedes(sid));
        sid
    }

    pub(crate) fn register_outgoing(&self, entry: RetryEntry) {
        self.core.register_outgoing(entry);
    }

    pub(crate) fn receive_ack(&mut self, header: &DataAckHeader) {
        self.core.receive_ack(header);
    }

    pub(crate) fn receive(&mut self, header: &DataHeader, payload: &[u8]) -> ReceiveOutcome {
        let mut deliveries = Vec::new();

        match self.core.accept_fragment(header, payload) {
            Accepted::Mismatch => return ReceiveOutcome::violation(),
            Accepted::Duplicate | Accepted::Stored => {}
            Accepted::Completed => {
                let assembler = self
                    .core
                    .assemblers
                    .get_mut(&header.sequence_id)
                    .expect("assembler exists: it just completed");
                deliveries.push(assembler.release());

                // everything at or below the delivered id is obsolete now
                let delivered = header.sequence_id;
                let mut sid = self.core.incoming_sequence_id;
                loop {
                    self.core.assemblers.remove(&sid);
                    if sid == delivered {
                        break;
                    }
                    sid = sid.next();
                }
                self.core.incoming_sequence_id = delivered.next();
            }
        }

        ReceiveOutcome {
            ack: Some(self.core.ack_for(header)),
            deliveries,
            violation: false,
        }
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        self.core.stats()
    }
}
