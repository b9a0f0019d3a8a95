//! Receiver-side reassembly of a fragmented message.
//!
//! One assembler tracks one in-flight incoming message: a backing buffer of
//!  `fragment_count * FRAGMENT_PAYLOAD` bytes, a presence bit per fragment and the
//!  length of the last fragment (by convention only the last fragment may be
//!  shorter than `FRAGMENT_PAYLOAD`).

use crate::config::{FRAGMENT_PAYLOAD, MAX_FRAGMENTS};
use crate::seq::SequenceId;

const BITSET_WORDS: usize = MAX_FRAGMENTS / 64;

pub struct FragmentAssembler {
    sequence_id: Option<SequenceId>,
    buffer: Vec<u8>,
    fragment_count: u8,
    /// length of the last fragment, known once it has arrived
    last_fragment_len: Option<usize>,
    present: [u64; BITSET_WORDS],
    present_count: u16,
    cancelled: bool,
}

impl FragmentAssembler {
    /// An empty slot for the unreliable ring; holds no message until `reset`.
    pub fn empty() -> FragmentAssembler {
        FragmentAssembler {
            sequence_id: None,
            buffer: Vec::new(),
            fragment_count: 0,
            last_fragment_len: None,
            present: [0; BITSET_WORDS],
            present_count: 0,
            cancelled: false,
        }
    }

    pub fn new(sequence_id: SequenceId, fragment_count: u8) -> FragmentAssembler {
        debug_assert!(fragment_count >= 1);

        FragmentAssembler {
            sequence_id: Some(sequence_id),
            buffer: vec![0; fragment_count as usize * FRAGMENT_PAYLOAD],
            fragment_count,
            last_fragment_len: None,
            present: [0; BITSET_WORDS],
            present_count: 0,
            cancelled: false,
        }
    }

    pub fn sequence_id(&self) -> Option<SequenceId> {
        self.sequence_id
    }

    pub fn fragment_count(&self) -> u8 {
        self.fragment_count
    }

    /// Rebinds the slot to a new message, reusing the backing allocation when it is
    ///  within 0.5x-1x of the required size.
    pub fn reset(&mut self, sequence_id: SequenceId, fragment_count: u8) {
        let required = fragment_count as usize * FRAGMENT_PAYLOAD;

        if required > self.buffer.capacity() || self.buffer.capacity() > required * 2 {
            self.buffer = vec![0; required];
        } else {
            self.buffer.resize(required, 0);
        }

        self.sequence_id = Some(sequence_id);
        self.fragment_count = fragment_count;
        self.last_fragment_len = None;
        self.present = [0; BITSET_WORDS];
        self.present_count = 0;
        self.cancelled = false;
    }

    pub fn has_fragment(&self, fragment_id: u8) -> bool {
        self.present[fragment_id as usize / 64] & (1u64 << (fragment_id as usize % 64)) != 0
    }

    /// Copies one fragment's payload into place and marks it present.
    ///
    /// Preconditions (checked by the caller against the wire header):
    ///  `fragment_id < fragment_count`, the bit is not already set, and
    ///  `payload.len() <= FRAGMENT_PAYLOAD`.
    pub fn receive(&mut self, fragment_id: u8, payload: &[u8]) {
        debug_assert!(fragment_id < self.fragment_count);
        debug_assert!(!self.has_fragment(fragment_id));
        debug_assert!(payload.len() <= FRAGMENT_PAYLOAD);

        let offset = fragment_id as usize * FRAGMENT_PAYLOAD;
        self.buffer[offset..offset + payload.len()].copy_from_slice(payload);

        if fragment_id == self.fragment_count - 1 {
            self.last_fragment_len = Some(payload.len());
        }

        self.present[fragment_id as usize / 64] |= 1u64 << (fragment_id as usize % 64);
        self.present_count += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.present_count == self.fragment_count as u16 && self.fragment_count > 0
    }

    /// Yields the contiguous reassembled message, truncated to its actual length,
    ///  and marks the assembler cancelled. The presence bits survive so later
    ///  duplicate fragments are still recognized.
    pub fn release(&mut self) -> Vec<u8> {
        debug_assert!(self.is_complete());

        let last_len = self
            .last_fragment_len
            .expect("complete assembler has seen its last fragment");
        let total = (self.fragment_count as usize - 1) * FRAGMENT_PAYLOAD + last_len;

        let mut data = std::mem::take(&mut self.buffer);
        data.truncate(total);

        self.cancelled = true;
        data
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn sid(raw: u32) -> SequenceId {
        SequenceId::from_raw(raw)
    }

    #[test]
    fn test_single_fragment() {
        let mut assembler = FragmentAssembler::new(sid(7), 1);
        assert!(!assembler.is_complete());

        assembler.receive(0, b"hello");
        assert!(assembler.is_complete());
        assert_eq!(assembler.release(), b"hello");
        assert!(assembler.is_cancelled());
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut assembler = FragmentAssembler::new(sid(1), 3);

        let frag0 = vec![0u8; FRAGMENT_PAYLOAD];
        let frag1 = vec![1u8; FRAGMENT_PAYLOAD];
        let frag2 = vec![2u8; 10];

        assembler.receive(2, &frag2);
        assert!(!assembler.is_complete());
        assembler.receive(0, &frag0);
        assert!(!assembler.is_complete());
        assembler.receive(1, &frag1);
        assert!(assembler.is_complete());

        let data = assembler.release();
        assert_eq!(data.len(), 2 * FRAGMENT_PAYLOAD + 10);
        assert_eq!(&data[..FRAGMENT_PAYLOAD], frag0.as_slice());
        assert_eq!(
            &data[FRAGMENT_PAYLOAD..2 * FRAGMENT_PAYLOAD],
            frag1.as_slice()
        );
        assert_eq!(&data[2 * FRAGMENT_PAYLOAD..], frag2.as_slice());
    }

    #[test]
    fn test_max_fragments_arbitrary_order() {
        let mut assembler = FragmentAssembler::new(sid(0), 255);

        // deliver in a scrambled but deterministic order
        let mut order: Vec<u8> = (0..255).collect();
        order.reverse();
        order.swap(0, 100);

        for &fid in &order {
            let payload = if fid == 254 {
                vec![fid; 17]
            } else {
                vec![fid; FRAGMENT_PAYLOAD]
            };
            assembler.receive(fid, &payload);
        }

        assert!(assembler.is_complete());
        let data = assembler.release();
        assert_eq!(data.len(), 254 * FRAGMENT_PAYLOAD + 17);
        for fid in 0..254usize {
            assert!(data[fid * FRAGMENT_PAYLOAD..(fid + 1) * FRAGMENT_PAYLOAD]
                .iter()
                .all(|&b| b == fid as u8));
        }
    }

    #[test]
    fn test_has_fragment() {
        let mut assembler = FragmentAssembler::new(sid(0), 2);
        assert!(!assembler.has_fragment(0));
        assert!(!assembler.has_fragment(1));

        assembler.receive(1, b"x");
        assert!(!assembler.has_fragment(0));
        assert!(assembler.has_fragment(1));
    }

    #[test]
    fn test_bits_survive_release() {
        let mut assembler = FragmentAssembler::new(sid(0), 1);
        assembler.receive(0, b"m");
        let _ = assembler.release();

        assert!(assembler.has_fragment(0));
        assert!(assembler.is_cancelled());
    }

    #[test]
    fn test_empty_slot() {
        let slot = FragmentAssembler::empty();
        assert_eq!(slot.sequence_id(), None);
        assert!(!slot.is_complete());
    }

    #[rstest]
    #[case::grow(2, 10, true)]
    #[case::equal(10, 10, false)]
    #[case::shrink_within_half(10, 5, false)]
    #[case::shrink_below_half(10, 4, true)]
    fn test_reset_reuse(#[case] initial: u8, #[case] next: u8, #[case] expect_realloc: bool) {
        let mut assembler = FragmentAssembler::new(sid(1), initial);
        let capacity_before = assembler.buffer.capacity();

        assembler.reset(sid(2), next);

        assert_eq!(assembler.sequence_id(), Some(sid(2)));
        assert_eq!(assembler.fragment_count(), next);
        assert!(!assembler.is_complete());
        assert_eq!(assembler.buffer.len(), next as usize * FRAGMENT_PAYLOAD);

        let reallocated = assembler.buffer.capacity() != capacity_before;
        assert_eq!(reallocated, expect_realloc);
    }

    #[test]
    fn test_reset_clears_bits() {
        let mut assembler = FragmentAssembler::new(sid(1), 2);
        assembler.receive(0, b"a");
        assembler.receive(1, b"b");
        let _ = assembler.release();

        assembler.reset(sid(2), 2);
        assert!(!assembler.has_fragment(0));
        assert!(!assembler.has_fragment(1));
        assert!(!assembler.is_cancelled());

        assembler.receive(0, &vec![9; FRAGMENT_PAYLOAD]);
        assembler.receive(1, b"tail");
        assert!(assembler.is_complete());
        assert_eq!(assembler.release().len(), FRAGMENT_PAYLOAD + 4);
    }

    #[test]
    fn test_empty_message() {
        let mut assembler = FragmentAssembler::new(sid(0), 1);
        assembler.receive(0, b"");
        assert!(assembler.is_complete());
        assert_eq!(assembler.release(), Vec::<u8>::new());
    }
}
