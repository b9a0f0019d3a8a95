//! Fixed-layout packet headers and their wire encoding.
//!
//! Every field is written and read explicitly, little-endian, so the encoding is
//!  identical on every platform regardless of native struct layout. The DATA
//!  header carries one explicit pad byte to keep `DATA_HEADER_BYTES` stable.

use crate::seq::SequenceId;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The one-byte discriminator at the start of every datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Connect = 0,
    ConnectOk = 1,
    ConnectAck = 2,
    Disconnect = 3,
    Data = 4,
    DataAck = 5,
}

/// Bytes occupied by the type byte plus the DATA header (including the pad byte).
pub const DATA_HEADER_BYTES: usize = 9;

/// Bytes occupied by the type byte plus the DATA_ACK header.
pub const DATA_ACK_HEADER_BYTES: usize = 11;

/// CONNECT_OK payload: the connection id chosen by the sender.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectOkHeader {
    pub connection_id: u16,
}

impl ConnectOkHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PacketType::ConnectOk.into());
        buf.put_u16_le(self.connection_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectOkHeader> {
        Ok(ConnectOkHeader {
            connection_id: buf.try_get_u16_le()?,
        })
    }
}

/// CONNECT_ACK payload: the connection id echoed back from CONNECT_OK.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ConnectAckHeader {
    pub connection_id: u16,
}

impl ConnectAckHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PacketType::ConnectAck.into());
        buf.put_u16_le(self.connection_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectAckHeader> {
        Ok(ConnectAckHeader {
            connection_id: buf.try_get_u16_le()?,
        })
    }
}

/// Header of a DATA fragment. Fragments of the same message share a sequence id;
///  `fragment_id` addresses the piece, `fragment_count` the total.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataHeader {
    pub sequence_id: SequenceId,
    pub channel_id: u8,
    pub fragment_count: u8,
    pub fragment_id: u8,
}

impl DataHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PacketType::Data.into());
        buf.put_u32_le(self.sequence_id.to_raw());
        buf.put_u8(self.channel_id);
        buf.put_u8(self.fragment_count);
        buf.put_u8(self.fragment_id);
        buf.put_u8(0); // pad
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataHeader> {
        let sequence_id = SequenceId::from_raw(buf.try_get_u32_le()?);
        let channel_id = buf.try_get_u8()?;
        let fragment_count = buf.try_get_u8()?;
        let fragment_id = buf.try_get_u8()?;
        let _pad = buf.try_get_u8()?;

        Ok(DataHeader {
            sequence_id,
            channel_id,
            fragment_count,
            fragment_id,
        })
    }

    /// Stamps this header into the first `DATA_HEADER_BYTES` of a prepared datagram.
    pub fn stamp(&self, datagram: &mut [u8]) {
        let mut buf = &mut datagram[..DATA_HEADER_BYTES];
        self.ser(&mut buf);
    }
}

/// Header of a DATA_ACK: acknowledges one specific `(sequence_id, fragment_id)` and
///  carries the receiver's contiguous high-water mark in `expected_sequence_id`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DataAckHeader {
    pub sequence_id: SequenceId,
    pub expected_sequence_id: SequenceId,
    pub channel_id: u8,
    pub fragment_id: u8,
}

impl DataAckHeader {
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(PacketType::DataAck.into());
        buf.put_u32_le(self.sequence_id.to_raw());
        buf.put_u32_le(self.expected_sequence_id.to_raw());
        buf.put_u8(self.channel_id);
        buf.put_u8(self.fragment_id);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataAckHeader> {
        Ok(DataAckHeader {
            sequence_id: SequenceId::from_raw(buf.try_get_u32_le()?),
            expected_sequence_id: SequenceId::from_raw(buf.try_get_u32_le()?),
            channel_id: buf.try_get_u8()?,
            fragment_id: buf.try_get_u8()?,
        })
    }
}
