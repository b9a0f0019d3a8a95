//! Write-side view over an outgoing message.
//!
//! A [`PacketStream`] is a `std::io::Write + std::io::Seek` sink over a virtual
//!  contiguous region of up to [`MAX_MESSAGE_SIZE`] bytes. Backing storage is a
//!  run of pool buffers acquired lazily as the cursor advances; each buffer
//!  reserves [`DATA_HEADER_BYTES`] at the front for the header the channel send
//!  path stamps in later. Nothing touches the socket until the stream is finished.

use crate::buffers::pool::{BufferPool, PooledBuf};
use crate::config::{FRAGMENT_PAYLOAD, MAX_MESSAGE_SIZE};
use crate::wire::DATA_HEADER_BYTES;
use std::cmp::min;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;

pub struct PacketStream {
    pool: Arc<BufferPool>,
    fragments: Vec<PooledBuf>,
    /// cursor in payload coordinates (header bytes not counted)
    pos: usize,
    /// high-water mark of positions the cursor has left behind
    max_pos: usize,
}

impl PacketStream {
    pub(crate) fn new(pool: Arc<BufferPool>) -> PacketStream {
        PacketStream {
            pool,
            fragments: Vec::new(),
            pos: 0,
            max_pos: 0,
        }
    }

    fn ensure_fragment(&mut self, index: usize) {
        while self.fragments.len() <= index {
            let mut buf = self.pool.acquire();
            buf.maximize_len();
            // recycled buffers carry stale bytes; unwritten payload must read as zero
            buf.as_mut()[DATA_HEADER_BYTES..].fill(0);
            self.fragments.push(buf);
        }
    }

    /// Total logical length of the message written so far.
    pub fn len(&self) -> usize {
        self.pos.max(self.max_pos)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the stream, yielding the fragment run and the payload length of the
    ///  last fragment. An empty message travels as one zero-payload fragment.
    pub(crate) fn finish(mut self) -> (Vec<PooledBuf>, usize) {
        let total = self.len();
        let fragment_count = if total == 0 {
            1
        } else {
            total.div_ceil(FRAGMENT_PAYLOAD)
        };

        self.ensure_fragment(fragment_count - 1);
        let last_len = total - (fragment_count - 1) * FRAGMENT_PAYLOAD;

        (std::mem::take(&mut self.fragments), last_len)
    }
}

impl Write for PacketStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.pos >= MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!(
                    "message exceeds the maximum size of {} bytes",
                    MAX_MESSAGE_SIZE
                ),
            ));
        }

        let index = self.pos / FRAGMENT_PAYLOAD;
        let offset = self.pos % FRAGMENT_PAYLOAD;
        self.ensure_fragment(index);

        let n = min(
            FRAGMENT_PAYLOAD - offset,
            min(data.len(), MAX_MESSAGE_SIZE - self.pos),
        );
        let start = DATA_HEADER_BYTES + offset;
        self.fragments[index].as_mut()[start..start + n].copy_from_slice(&data[..n]);

        self.pos += n;
        self.max_pos = self.max_pos.max(self.pos);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for PacketStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(offset) => self.pos as i64 + offset,
            SeekFrom::End(offset) => MAX_MESSAGE_SIZE as i64 + offset,
        };

        if new_pos < 0 || new_pos > MAX_MESSAGE_SIZE as i64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "seek position {} outside of [0, {}]",
                    new_pos, MAX_MESSAGE_SIZE
                ),
            ));
        }

        self.max_pos = self.max_pos.max(self.pos);
        self.pos = new_pos as usize;
        Ok(new_pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload_of(fragment: &PooledBuf) -> &[u8] {
        &fragment.as_ref()[DATA_HEADER_BYTES..]
    }

    #[test]
    fn test_empty_message_is_one_empty_fragment() {
        let stream = PacketStream::new(Arc::new(BufferPool::new()));
        assert!(stream.is_empty());

        let (fragments, last_len) = stream.finish();
        assert_eq!(fragments.len(), 1);
        assert_eq!(last_len, 0);
    }

    #[test]
    fn test_small_message_single_fragment() {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        stream.write_all(b"hello world").unwrap();
        assert_eq!(stream.len(), 11);

        let (fragments, last_len) = stream.finish();
        assert_eq!(fragments.len(), 1);
        assert_eq!(last_len, 11);
        assert_eq!(&payload_of(&fragments[0])[..11], b"hello world");
    }

    #[rstest]
    #[case::exactly_one(FRAGMENT_PAYLOAD, 1, FRAGMENT_PAYLOAD)]
    #[case::one_more(FRAGMENT_PAYLOAD + 1, 2, 1)]
    #[case::exactly_two(2 * FRAGMENT_PAYLOAD, 2, FRAGMENT_PAYLOAD)]
    #[case::large(5 * FRAGMENT_PAYLOAD + 123, 6, 123)]
    #[case::max(MAX_MESSAGE_SIZE, 255, FRAGMENT_PAYLOAD)]
    fn test_fragment_boundaries(
        #[case] size: usize,
        #[case] expected_fragments: usize,
        #[case] expected_last_len: usize,
    ) {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
        stream.write_all(&data).unwrap();

        let (fragments, last_len) = stream.finish();
        assert_eq!(fragments.len(), expected_fragments);
        assert_eq!(last_len, expected_last_len);

        // content is split across payload regions in order
        let mut reassembled = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let take = if i == fragments.len() - 1 {
                last_len
            } else {
                FRAGMENT_PAYLOAD
            };
            reassembled.extend_from_slice(&payload_of(fragment)[..take]);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        let chunk = vec![0u8; FRAGMENT_PAYLOAD];
        for _ in 0..255 {
            stream.write_all(&chunk).unwrap();
        }

        let result = stream.write_all(b"x");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_seek_absolute_and_overwrite() {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        stream.write_all(b"aaaaaaaa").unwrap();

        stream.seek(SeekFrom::Start(2)).unwrap();
        stream.write_all(b"XX").unwrap();

        let (fragments, last_len) = stream.finish();
        assert_eq!(last_len, 8, "overwriting does not shrink the message");
        assert_eq!(&payload_of(&fragments[0])[..8], b"aaXXaaaa");
    }

    #[test]
    fn test_seek_relative() {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        stream.write_all(b"0123456789").unwrap();

        stream.seek(SeekFrom::Current(-4)).unwrap();
        stream.write_all(b"xy").unwrap();

        let (fragments, last_len) = stream.finish();
        assert_eq!(last_len, 10);
        assert_eq!(&payload_of(&fragments[0])[..10], b"012345xy89");
    }

    #[test]
    fn test_seek_from_end() {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        let pos = stream.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(pos as usize, MAX_MESSAGE_SIZE);

        assert!(stream.seek(SeekFrom::End(1)).is_err());
        assert!(stream.seek(SeekFrom::Current(-1)).is_ok());
    }

    #[test]
    fn test_seek_before_start_rejected() {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        assert!(stream.seek(SeekFrom::Current(-1)).is_err());
        assert!(stream.seek(SeekFrom::Start(5)).is_ok());
    }

    #[test]
    fn test_seek_forward_gap_reads_as_zero() {
        let pool = Arc::new(BufferPool::new());

        // dirty a buffer and recycle it so the pool hands back stale bytes
        {
            let mut buf = pool.acquire();
            buf.maximize_len();
            buf.as_mut().fill(0xee);
        }

        let mut stream = PacketStream::new(pool);
        stream.seek(SeekFrom::Start(4)).unwrap();
        stream.write_all(b"tail").unwrap();

        let (fragments, last_len) = stream.finish();
        assert_eq!(last_len, 8);
        assert_eq!(&payload_of(&fragments[0])[..8], b"\0\0\0\0tail");
    }

    #[test]
    fn test_cursor_position_after_writes() {
        let mut stream = PacketStream::new(Arc::new(BufferPool::new()));
        stream.write_all(&vec![7u8; FRAGMENT_PAYLOAD + 5]).unwrap();
        assert_eq!(
            stream.stream_position().unwrap() as usize,
            FRAGMENT_PAYLOAD + 5
        );
    }

    #[test]
    fn test_buffers_return_to_pool_on_drop() {
        let pool = Arc::new(BufferPool::new());
        {
            let mut stream = PacketStream::new(pool.clone());
            stream.write_all(&vec![0u8; 3 * FRAGMENT_PAYLOAD]).unwrap();
            // dropped without finish, e.g. because the writer callback failed
        }
        assert_eq!(pool.free_count(), 3);
    }
}
