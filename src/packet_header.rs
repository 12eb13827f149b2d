use crate::error::DecodeError;
use crate::seq::SeqNo;
use bytes::{Buf, BufMut, BytesMut};

pub const PROTOCOL_MAGIC: u16 = 0xBEEF;
pub const PROTOCOL_VERSION: u8 = 1;

/// Serialized header size in bytes. Every packet on the wire starts with
/// exactly this many bytes, so `mtu - HEADER_SIZE` is the payload budget.
pub const HEADER_SIZE: usize = 32;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u8)]
pub enum PacketType {
    Data = 0x01,
    Ack = 0x02,
    Syn = 0x03,
    SynAck = 0x04,
    Fin = 0x05,
    FinAck = 0x06,
    Ping = 0x07,
    Pong = 0x08,
    Fragment = 0x09,
    FragmentAck = 0x0A,
    Nack = 0x0B,
    Rst = 0x0C,
}

impl PacketType {
    pub fn from_wire(raw: u8) -> Result<PacketType, DecodeError> {
        match raw {
            0x01 => Ok(PacketType::Data),
            0x02 => Ok(PacketType::Ack),
            0x03 => Ok(PacketType::Syn),
            0x04 => Ok(PacketType::SynAck),
            0x05 => Ok(PacketType::Fin),
            0x06 => Ok(PacketType::FinAck),
            0x07 => Ok(PacketType::Ping),
            0x08 => Ok(PacketType::Pong),
            0x09 => Ok(PacketType::Fragment),
            0x0A => Ok(PacketType::FragmentAck),
            0x0B => Ok(PacketType::Nack),
            0x0C => Ok(PacketType::Rst),
            other => Err(DecodeError::UnknownType(other)),
        }
    }

    /// Control packets carry protocol state rather than application payload.
    pub fn is_control(self) -> bool {
        !matches!(self, PacketType::Data | PacketType::Fragment)
    }
}

/// Boolean packet attributes, one bit each. Unknown bits are preserved on
/// round-trip and otherwise ignored.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Payload was deflated by the sender and must be inflated on receipt.
    pub const COMPRESSED: PacketFlags = PacketFlags(0x01);
    /// The packet occupies sequence space and expects acknowledgment.
    pub const RELIABLE: PacketFlags = PacketFlags(0x04);
    /// Highest-index fragment of a fragmented message.
    pub const LAST_FRAGMENT: PacketFlags = PacketFlags(0x40);

    pub fn from_raw(raw: u8) -> PacketFlags {
        PacketFlags(raw)
    }

    pub fn to_raw(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | other.0)
    }

    pub fn without(self, other: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 & !other.0)
    }
}

/// The fixed 32-byte packet header. All multi-byte fields are big-endian.
///
/// ```ascii
///  0: magic            u16   0xBEEF
///  2: version          u8
///  3: type             u8
///  4: flags            u8
///  5: sequence         u32
///  9: ack              u32
/// 13: window           u16   receiver's free buffer in bytes, clamped to 16 bits
/// 15: checksum         u16   low 16 bits of CRC32, see `Packet`
/// 17: payload length   u32
/// 21: fragment id      u32
/// 25: fragment index   u16
/// 27: fragment total   u16
/// 29: reserved         3 zero bytes
/// ```
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub sequence: SeqNo,
    pub ack: SeqNo,
    pub window: u16,
    pub checksum: u16,
    pub payload_length: u32,
    pub fragment_id: u32,
    pub fragment_index: u16,
    pub fragment_total: u16,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType) -> PacketHeader {
        PacketHeader {
            packet_type,
            flags: PacketFlags::NONE,
            sequence: SeqNo::ZERO,
            ack: SeqNo::ZERO,
            window: 0,
            checksum: 0,
            payload_length: 0,
            fragment_id: 0,
            fragment_index: 0,
            fragment_total: 0,
        }
    }

    /// The byte offset of the checksum field inside the serialized header.
    pub const CHECKSUM_OFFSET: usize = 15;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u16(PROTOCOL_MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags.to_raw());
        buf.put_u32(self.sequence.to_raw());
        buf.put_u32(self.ack.to_raw());
        buf.put_u16(self.window);
        buf.put_u16(self.checksum);
        buf.put_u32(self.payload_length);
        buf.put_u32(self.fragment_id);
        buf.put_u16(self.fragment_index);
        buf.put_u16(self.fragment_total);
        buf.put_slice(&[0u8; 3]);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, DecodeError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }

        let magic = buf.get_u16();
        if magic != PROTOCOL_MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let packet_type = PacketType::from_wire(buf.get_u8())?;
        let flags = PacketFlags::from_raw(buf.get_u8());
        let sequence = SeqNo::from_raw(buf.get_u32());
        let ack = SeqNo::from_raw(buf.get_u32());
        let window = buf.get_u16();
        let checksum = buf.get_u16();
        let payload_length = buf.get_u32();
        let fragment_id = buf.get_u32();
        let fragment_index = buf.get_u16();
        let fragment_total = buf.get_u16();
        buf.advance(3); // reserved

        Ok(PacketHeader {
            packet_type,
            flags,
            sequence,
            ack,
            window,
            checksum,
            payload_length,
            fragment_id,
            fragment_index,
            fragment_total,
        })
    }
}
