//! The two unreliable disciplines. Nothing is retained on the send side and no
//!  ACKs are ever produced. Single-fragment messages bypass reassembly entirely;
//!  fragmented ones go through a fixed ring of assembler slots indexed by
//!  `sequence_id mod ASSEMBLER_SLOTS`, where newer messages evict older ones.

use crate::channel::{ChannelStats, ReceiveOutcome};
use crate::config::ASSEMBLER_SLOTS;
use crate::fragment::FragmentAssembler;
use crate::seq::SequenceId;
use crate::wire::DataHeader;
use tracing::trace;

pub(crate) struct UnreliableCore {
    sequence_id: SequenceId,
    assemblers: Vec<FragmentAssembler>,
}

impl UnreliableCore {
    fn new() -> UnreliableCore {
        UnreliableCore {
            sequence_id: SequenceId::ZERO,
            assemblers: (0..ASSEMBLER_SLOTS)
                .map(|_| FragmentAssembler::empty())
                .collect(),
        }
    }

    fn next_sequence_id(&mut self) -> SequenceId {
        let id = self.sequence_id;
        self.sequence_id = id.next();
        id
    }

    fn accept(&mut self, header: &DataHeader, payload: &[u8]) -> Option<Vec<u8>> {
        if header.fragment_count == 1 {
            // non-fragmented fast path: no assembler involved
            return Some(payload.to_vec());
        }

        let slot = header.sequence_id.to_raw() as usize % ASSEMBLER_SLOTS;
        let assembler = &mut self.assemblers[slot];

        let is_stale = match assembler.sequence_id() {
            None => true,
            Some(current) => current.precedes(header.sequence_id),
        };
        if is_stale {
            trace!(
                "rebinding assembler slot {} to message {}",
                slot,
                header.sequence_id
            );
            assembler.reset(header.sequence_id, header.fragment_count);
        }

        if assembler.sequence_id() != Some(header.sequence_id) {
            // an older message's fragment whose slot has moved on
            return None;
        }
        if assembler.fragment_count() != header.fragment_count
            || assembler.is_cancelled()
            || assembler.has_fragment(header.fragment_id)
        {
            return None;
        }

        assembler.receive(header.fragment_id, payload);

        if assembler.is_complete() {
            Some(assembler.release())
        } else {
            None
        }
    }

    fn stats(&self) -> ChannelStats {
        ChannelStats {
            outgoing_queue_len: 0,
            pending_assemblies: self
                .assemblers
                .iter()
                .filter(|a| a.sequence_id().is_some() && !a.is_complete() && !a.is_cancelled())
                .count(),
        }
    }
}

/// Unreliable unordered: whatever completes is delivered, in whatever order.
pub struct UnreliableUnorderedChannel {
    core: UnreliableCore,
}

impl UnreliableUnorderedChannel {
    pub(crate) fn new() -> UnreliableUnorderedChannel {
        UnreliableUnorderedChannel {
            core: UnreliableCore::new(),
        }
    }

    pub(crate) fn next_sequence_id(&mut self) -> SequenceId {
        self.core.next_sequence_id()
    }

    pub(crate) fn receive(&mut self, header: &DataHeader, payload: &[u8]) -> ReceiveOutcome {
        ReceiveOutcome {
            deliveries: self.core.accept(header, payload).into_iter().collect(),
            ack: None,
            violation: false,
        }
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        self.core.stats()
    }
}

/// Unreliable sequenced: stale messages are dropped, so delivered sequence ids
///  are strictly increasing.
pub struct UnreliableSequencedChannel {
    core: UnreliableCore,
    next_expected: SequenceId,
}

impl UnreliableSequencedChannel {
    pub(crate) fn new() -> UnreliableSequencedChannel {
        UnreliableSequencedChannel {
            core: UnreliableCore::new(),
            next_expected: SequenceId::ZERO,
        }
    }

    pub(crate) fn next_sequence_id(&mut self) -> SequenceId {
        self.core.next_sequence_id()
    }

    pub(crate) fn receive(&mut self, header: &DataHeader, payload: &[u8]) -> ReceiveOutcome {
        let mut deliveries = Vec::new();

        if !header.sequence_id.precedes(self.next_expected) {
            if let Some(data) = self.core.accept(header, payload) {
                self.next_expected = header.sequence_id.next();
                deliveries.push(data);
            }
        } else {
            trace!(
                "dropping stale message {} (next expected {})",
                header.sequence_id,
                self.next_expected
            );
        }

        ReceiveOutcome {
            deliveries,
            ack: None,
            violation: false,
        }
    }

    pub(crate) fn stats(&self) -> ChannelStats {
        self.core.stats()
    }
}
