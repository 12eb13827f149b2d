use crate::error::DecodeError;
use crate::packet_header::{PacketFlags, PacketHeader, PacketType, HEADER_SIZE};
use crate::seq::SeqNo;
use anyhow::Context;
use bytes::{Bytes, BytesMut};
use crc::Crc;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// A complete wire packet: fixed header plus opaque payload.
///
/// The checksum is the low 16 bits of the CRC32 over the serialized header
/// with the checksum field zeroed, followed by the payload. `encode` computes
/// and embeds it; `decode` recomputes and rejects mismatches.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    fn with_payload(mut header: PacketHeader, payload: Bytes) -> Packet {
        header.payload_length = payload.len() as u32;
        Packet { header, payload }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Whether this packet occupies sequence space and is retransmitted until
    /// acknowledged.
    pub fn requires_ack(&self) -> bool {
        self.header.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn is_fragment(&self) -> bool {
        self.header.fragment_total > 1
    }

    fn checksum_of(header_bytes: &mut [u8], payload: &[u8]) -> u16 {
        header_bytes[PacketHeader::CHECKSUM_OFFSET] = 0;
        header_bytes[PacketHeader::CHECKSUM_OFFSET + 1] = 0;

        let mut digest = CRC32.digest();
        digest.update(header_bytes);
        digest.update(payload);
        (digest.finalize() & 0xFFFF) as u16
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        let mut header = self.header.clone();
        header.payload_length = self.payload.len() as u32;
        header.checksum = 0;
        header.ser(&mut buf);

        let checksum = Self::checksum_of(&mut buf[..HEADER_SIZE], &self.payload);
        buf[PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 2]
            .copy_from_slice(&checksum.to_be_bytes());

        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(datagram: &[u8]) -> Result<Packet, DecodeError> {
        let mut read: &[u8] = datagram;
        let header = PacketHeader::deser(&mut read)?;

        let actual = read.len() as u32;
        if header.payload_length != actual {
            return Err(DecodeError::LengthMismatch {
                declared: header.payload_length,
                actual,
            });
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&datagram[..HEADER_SIZE]);
        let computed = Self::checksum_of(&mut header_bytes, read);
        if computed != header.checksum {
            return Err(DecodeError::ChecksumMismatch {
                expected: header.checksum,
                computed,
            });
        }

        Ok(Packet {
            header,
            payload: Bytes::copy_from_slice(read),
        })
    }

    /// Deflate the payload in place and set the `COMPRESSED` flag - only if
    /// compression actually shrinks it.
    pub fn compress(&mut self) {
        if self.header.flags.contains(PacketFlags::COMPRESSED) || self.payload.is_empty() {
            return;
        }

        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(self.payload.len()),
            Compression::default(),
        );
        // writing into a Vec cannot fail
        encoder.write_all(&self.payload).expect("write to Vec failed");
        let compressed = encoder.finish().expect("write to Vec failed");

        if compressed.len() < self.payload.len() {
            self.payload = Bytes::from(compressed);
            self.header.payload_length = self.payload.len() as u32;
            self.header.flags = self.header.flags.with(PacketFlags::COMPRESSED);
        }
    }

    /// Inflate a compressed payload in place and clear the flag. Fails on
    /// malformed deflate data, which means a buggy or hostile sender - the
    /// caller drops the packet.
    pub fn decompress(&mut self) -> anyhow::Result<()> {
        if !self.header.flags.contains(PacketFlags::COMPRESSED) {
            return Ok(());
        }

        let mut inflated = Vec::new();
        ZlibDecoder::new(self.payload.as_ref())
            .read_to_end(&mut inflated)
            .context("inflating compressed payload")?;

        self.payload = Bytes::from(inflated);
        self.header.payload_length = self.payload.len() as u32;
        self.header.flags = self.header.flags.without(PacketFlags::COMPRESSED);
        Ok(())
    }

    pub fn syn(sequence: SeqNo) -> Packet {
        let mut header = PacketHeader::new(PacketType::Syn);
        header.flags = PacketFlags::RELIABLE;
        header.sequence = sequence;
        Packet::with_payload(header, Bytes::new())
    }

    pub fn syn_ack(sequence: SeqNo, ack: SeqNo) -> Packet {
        let mut header = PacketHeader::new(PacketType::SynAck);
        header.flags = PacketFlags::RELIABLE;
        header.sequence = sequence;
        header.ack = ack;
        Packet::with_payload(header, Bytes::new())
    }

    pub fn ack(ack: SeqNo, window: u16) -> Packet {
        let mut header = PacketHeader::new(PacketType::Ack);
        header.ack = ack;
        header.window = window;
        Packet::with_payload(header, Bytes::new())
    }

    pub fn data(sequence: SeqNo, ack: SeqNo, payload: Bytes, window: u16) -> Packet {
        let mut header = PacketHeader::new(PacketType::Data);
        header.flags = PacketFlags::RELIABLE;
        header.sequence = sequence;
        header.ack = ack;
        header.window = window;
        Packet::with_payload(header, payload)
    }

    /// A fire-and-forget data packet: occupies no sequence space, expects no
    /// acknowledgment.
    pub fn data_unreliable(payload: Bytes) -> Packet {
        let header = PacketHeader::new(PacketType::Data);
        Packet::with_payload(header, payload)
    }

    pub fn fin(sequence: SeqNo) -> Packet {
        let mut header = PacketHeader::new(PacketType::Fin);
        header.flags = PacketFlags::RELIABLE;
        header.sequence = sequence;
        Packet::with_payload(header, Bytes::new())
    }

    pub fn fin_ack(ack: SeqNo, window: u16) -> Packet {
        let mut header = PacketHeader::new(PacketType::FinAck);
        header.ack = ack;
        header.window = window;
        Packet::with_payload(header, Bytes::new())
    }

    /// A keepalive probe. The payload is the sender's monotonic clock reading
    /// so the echoed PONG yields an RTT sample even for retransmitted pings.
    pub fn ping(sequence: SeqNo, clock_seconds: f64) -> Packet {
        let mut header = PacketHeader::new(PacketType::Ping);
        header.flags = PacketFlags::RELIABLE;
        header.sequence = sequence;
        Packet::with_payload(header, Bytes::copy_from_slice(&clock_seconds.to_be_bytes()))
    }

    /// The reply to a PING: echoes the ping payload and cumulatively
    /// acknowledges the ping's sequence number.
    pub fn pong(ack: SeqNo, echoed_payload: Bytes) -> Packet {
        let mut header = PacketHeader::new(PacketType::Pong);
        header.ack = ack;
        Packet::with_payload(header, echoed_payload)
    }

    pub fn fragment(
        sequence: SeqNo,
        fragment_id: u32,
        fragment_index: u16,
        fragment_total: u16,
        payload: Bytes,
        reliable: bool,
    ) -> Packet {
        let mut header = PacketHeader::new(PacketType::Fragment);
        header.sequence = sequence;
        header.fragment_id = fragment_id;
        header.fragment_index = fragment_index;
        header.fragment_total = fragment_total;
        if reliable {
            header.flags = header.flags.with(PacketFlags::RELIABLE);
        }
        if fragment_index + 1 == fragment_total {
            header.flags = header.flags.with(PacketFlags::LAST_FRAGMENT);
        }
        Packet::with_payload(header, payload)
    }

    /// Notifies the sender that a fragmented message was fully reassembled.
    pub fn fragment_ack(fragment_id: u32) -> Packet {
        let mut header = PacketHeader::new(PacketType::FragmentAck);
        header.fragment_id = fragment_id;
        Packet::with_payload(header, Bytes::new())
    }

    /// Requests immediate retransmission of one sequence number.
    pub fn nack(requested: SeqNo) -> Packet {
        let mut header = PacketHeader::new(PacketType::Nack);
        header.ack = requested;
        Packet::with_payload(header, Bytes::new())
    }

    pub fn rst() -> Packet {
        let header = PacketHeader::new(PacketType::Rst);
        Packet::with_payload(header, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(Packet::ack(SeqNo::from_raw(17), 512))]
    #[case::syn(Packet::syn(SeqNo::from_raw(9999)))]
    #[case::data(Packet::data(SeqNo::from_raw(5), SeqNo::from_raw(3), Bytes::from_static(b"hello"), 65535))]
    #[case::fragment(Packet::fragment(SeqNo::from_raw(7), 0xABCD1234, 1, 3, Bytes::from_static(&[0xAB; 100]), true))]
    #[case::rst(Packet::rst())]
    fn test_round_trip(#[case] original: Packet) {
        let encoded = original.encode();
        let mut decoded = Packet::decode(&encoded).unwrap();

        // encode embeds the computed checksum; the constructors leave it zero
        assert_ne!(decoded.header.checksum, 0);
        decoded.header.checksum = 0;
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_checksum_detects_payload_corruption() {
        let packet = Packet::data(
            SeqNo::from_raw(1),
            SeqNo::ZERO,
            Bytes::from_static(b"some payload"),
            65535,
        );
        let mut encoded = BytesMut::from(packet.encode().as_ref());
        let flip_at = HEADER_SIZE + 3;
        encoded[flip_at] ^= 0x01;

        assert!(matches!(
            Packet::decode(&encoded),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_detects_header_corruption() {
        let packet = Packet::data(
            SeqNo::from_raw(1),
            SeqNo::ZERO,
            Bytes::from_static(b"some payload"),
            65535,
        );
        let mut encoded = BytesMut::from(packet.encode().as_ref());
        encoded[5] ^= 0x80; // flip a sequence bit

        assert!(matches!(
            Packet::decode(&encoded),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let packet = Packet::data(
            SeqNo::from_raw(1),
            SeqNo::ZERO,
            Bytes::from_static(b"abcdef"),
            65535,
        );
        let encoded = packet.encode();

        // truncate the payload but leave the declared length alone
        assert!(matches!(
            Packet::decode(&encoded[..encoded.len() - 2]),
            Err(DecodeError::LengthMismatch {
                declared: 6,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_compress_round_trip() {
        let payload = Bytes::from(vec![0x42u8; 4000]);
        let mut packet = Packet::data(SeqNo::from_raw(1), SeqNo::ZERO, payload.clone(), 65535);

        packet.compress();
        assert!(packet.header.flags.contains(PacketFlags::COMPRESSED));
        assert!(packet.payload.len() < payload.len());

        // survives the wire
        let mut decoded = Packet::decode(&packet.encode()).unwrap();
        decoded.decompress().unwrap();
        assert_eq!(decoded.payload, payload);
        assert!(!decoded.header.flags.contains(PacketFlags::COMPRESSED));
    }

    #[test]
    fn test_compress_skips_incompressible_payload() {
        let payload = Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut packet = Packet::data(SeqNo::from_raw(1), SeqNo::ZERO, payload.clone(), 65535);

        packet.compress();
        // the zlib envelope alone outweighs a payload this small, so the flag stays clear
        assert!(!packet.header.flags.contains(PacketFlags::COMPRESSED));
        assert_eq!(packet.payload, payload);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        let mut packet = Packet::data(
            SeqNo::from_raw(1),
            SeqNo::ZERO,
            Bytes::from_static(b"not zlib data"),
            65535,
        );
        packet.header.flags = packet.header.flags.with(PacketFlags::COMPRESSED);
        assert!(packet.decompress().is_err());
    }

    #[test]
    fn test_last_fragment_flag() {
        let mid = Packet::fragment(SeqNo::ZERO, 1, 0, 3, Bytes::from_static(b"a"), true);
        let last = Packet::fragment(SeqNo::ZERO, 1, 2, 3, Bytes::from_static(b"c"), true);
        assert!(!mid.header.flags.contains(PacketFlags::LAST_FRAGMENT));
        assert!(last.header.flags.contains(PacketFlags::LAST_FRAGMENT));
    }

    #[test]
    fn test_pure_ack_occupies_no_sequence_space() {
        let ack = Packet::ack(SeqNo::from_raw(10), 100);
        assert!(!ack.requires_ack());
        assert_eq!(ack.header.sequence, SeqNo::ZERO);
    }
}
