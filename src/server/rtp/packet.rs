//! RTP packet wire format
//!
//! Fixed 12-byte RFC 3550 header (no CSRC list, no extension, no padding)
//! followed by opaque payload bytes.

use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed RTP header
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP protocol version carried in every header
pub const RTP_VERSION: u8 = 2;

/// RTP packet header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Marker bit
    pub marker: bool,
    /// Payload type (7 bits; 0 = PCMU, 8 = PCMA)
    pub payload_type: u8,
    /// Sequence number
    pub sequence: u16,
    /// Timestamp
    pub timestamp: u32,
    /// Synchronization source identifier
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    fn write(&self, buf: &mut BytesMut) {
        // V(2) P(1) X(1) CC(4): padding, extension and CSRC count are always zero
        buf.put_u8(RTP_VERSION << 6);
        // M(1) PT(7)
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7F));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
    }

    fn read(data: &[u8]) -> Option<Self> {
        if data.len() < RTP_HEADER_SIZE {
            return None;
        }

        let second_byte = data[1];
        Some(Self {
            marker: second_byte & 0x80 != 0,
            payload_type: second_byte & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// RTP packet with header and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    /// Serialize header + payload into one contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.header.write(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a received datagram.
    ///
    /// Returns `None` when the buffer cannot hold a full header; such a
    /// datagram is treated as empty and must be dropped by the caller.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let header = RtpHeader::read(data)?;
        let payload = Bytes::copy_from_slice(&data[RTP_HEADER_SIZE..]);
        Some(Self { header, payload })
    }

    /// Payload length in bytes
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Total packet length (header + payload)
    pub fn len(&self) -> usize {
        RTP_HEADER_SIZE + self.payload.len()
    }
}

/// Sequential packetizer for one outgoing stream
#[derive(Debug)]
pub struct RtpPacketizer {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    first: bool,
}

impl RtpPacketizer {
    /// Create a packetizer with random SSRC, sequence and timestamp origins
    pub fn new(payload_type: u8) -> Self {
        Self {
            payload_type,
            ssrc: rand::random::<u32>(),
            sequence: rand::random::<u16>(),
            timestamp: rand::random::<u32>(),
            first: true,
        }
    }

    /// Wrap one payload chunk. The timestamp advances by the payload length,
    /// which is the sample count for G.711.
    pub fn packetize(&mut self, payload: Bytes) -> RtpPacket {
        let header = RtpHeader::new(self.payload_type, self.sequence, self.timestamp, self.ssrc)
            .with_marker(self.first);

        self.first = false;
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(payload.len() as u32);

        RtpPacket::new(header, payload)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_preserves_fields() {
        let header = RtpHeader::new(8, 0xBEEF, 0xDEAD_BEEF, 0x0102_0304).with_marker(true);
        let packet = RtpPacket::new(header, Bytes::from_static(&[1, 2, 3, 4, 5]));

        let encoded = packet.encode();
        assert_eq!(encoded.len(), RTP_HEADER_SIZE + 5);
        assert_eq!(encoded[0], 0x80);

        let decoded = RtpPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.payload_len(), 5);
    }

    #[test]
    fn test_empty_payload() {
        let packet = RtpPacket::new(RtpHeader::new(0, 1, 160, 42), Bytes::new());
        let encoded = packet.encode();
        assert_eq!(encoded.len(), RTP_HEADER_SIZE);

        let decoded = RtpPacket::decode(&encoded).unwrap();
        assert_eq!(decoded.payload_len(), 0);
        assert_eq!(decoded.header.timestamp, 160);
    }

    #[test]
    fn test_short_buffers_are_invalid() {
        for len in 0..RTP_HEADER_SIZE {
            let data = vec![0x80u8; len];
            assert!(RtpPacket::decode(&data).is_none(), "length {} should be rejected", len);
        }
    }

    #[test]
    fn test_decode_fifteen_byte_buffer() {
        let data = [
            0x80, 0x41, // V=2, marker clear, PT 0x41
            0x12, 0x34, // sequence
            0x00, 0x00, 0x03, 0x20, // timestamp
            0xCA, 0xFE, 0xBA, 0xBE, // SSRC
            0xAA, 0xBB, 0xCC, // payload
        ];

        let packet = RtpPacket::decode(&data).unwrap();
        assert_eq!(packet.header.payload_type, 0x41 & 0x7F);
        assert!(!packet.header.marker);
        assert_eq!(packet.header.sequence, 0x1234);
        assert_eq!(packet.header.timestamp, 800);
        assert_eq!(packet.header.ssrc, 0xCAFE_BABE);
        assert_eq!(&packet.payload[..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_marker_bit_is_high_bit_of_second_byte() {
        let mut data = [0u8; 13];
        data[0] = 0x80;
        data[1] = 0x80 | 0x08;

        let packet = RtpPacket::decode(&data).unwrap();
        assert!(packet.header.marker);
        assert_eq!(packet.header.payload_type, 8);
    }

    #[test]
    fn test_packetizer_sequence_and_timestamp() {
        let mut packetizer = RtpPacketizer::new(0);

        let first = packetizer.packetize(Bytes::from(vec![0u8; 160]));
        let second = packetizer.packetize(Bytes::from(vec![0u8; 160]));

        assert!(first.header.marker);
        assert!(!second.header.marker);
        assert_eq!(second.header.sequence, first.header.sequence.wrapping_add(1));
        assert_eq!(second.header.timestamp, first.header.timestamp.wrapping_add(160));
        assert_eq!(first.header.ssrc, packetizer.ssrc());
        assert_eq!(second.header.ssrc, packetizer.ssrc());
    }
}
