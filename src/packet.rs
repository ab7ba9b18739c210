//! Segment format.
//!
//! Fields already present in the link frame are not repeated:
//!
//! ```text
//! +---------------------+---------------------+
//! | Segment field       | Link frame field    |
//! +=====================+=====================+
//! | Destination host    | Destination host    |
//! +---------------------+---------------------+
//! | Source host         | Source host         |
//! +---------------------+---------------------+
//! | Length              | Length              |
//! +---------------------+---------------------+
//! ```
use crate::error::MalformedSegment;
use addr::{is_valid_port, ConnectionKey, Endpoint, HostId, Port};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};
use link::{Frame, MAX_CONTENTS_LEN};

/// Sequence number of a tracked segment.
pub type SequenceNumber = u32;

/// Length of the segment header.
pub const HEADER_LEN: usize = 8;

/// Maximum length of the payload.
pub const MAX_PAYLOAD: usize = MAX_CONTENTS_LEN - HEADER_LEN;

/// Control flags of a segment.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Flags(u8);

impl Flags {
    /// Connection-open request.
    pub const SYN: Flags = Flags(0b0001);
    /// Acknowledgment.
    pub const ACK: Flags = Flags(0b0010);
    /// Stop sending.
    pub const STP: Flags = Flags(0b0100);
    /// Finish.
    pub const FIN: Flags = Flags(0b1000);

    const ALL: u8 = 0b1111;

    /// No flags, a data segment.
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Returns the flags if no undefined bits are set.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            return None;
        }
        Some(Flags(bits))
    }

    /// Raw flag bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Returns true if all flags in `other` are set.
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "DATA");
        }
        let names = [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::STP, "STP"),
            (Flags::FIN, "FIN"),
        ];
        let mut first = true;
        for (flag, name) in names.iter() {
            if self.contains(*flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// The protocol meaning of a segment's flag combination.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SegmentKind {
    /// No control flags.
    Data,
    /// Connection-open request.
    Syn,
    /// Acknowledges a SYN.
    SynAck,
    /// Acknowledges a DATA or STP.
    Ack,
    /// Stop sending.
    Stp,
    /// Finish.
    Fin,
    /// Acknowledges a FIN.
    FinAck,
}

impl SegmentKind {
    /// Classifies a flag combination. Combinations without a meaning return
    /// `None`.
    pub fn from_flags(flags: Flags) -> Option<Self> {
        let kind = match flags.bits() {
            0 => SegmentKind::Data,
            0b0001 => SegmentKind::Syn,
            0b0011 => SegmentKind::SynAck,
            0b0010 => SegmentKind::Ack,
            0b0100 => SegmentKind::Stp,
            0b1000 => SegmentKind::Fin,
            0b1010 => SegmentKind::FinAck,
            _ => return None,
        };
        Some(kind)
    }

    /// Flags carried by segments of this kind.
    pub fn flags(self) -> Flags {
        match self {
            SegmentKind::Data => Flags::empty(),
            SegmentKind::Syn => Flags::SYN,
            SegmentKind::SynAck => Flags::SYN | Flags::ACK,
            SegmentKind::Ack => Flags::ACK,
            SegmentKind::Stp => Flags::STP,
            SegmentKind::Fin => Flags::FIN,
            SegmentKind::FinAck => Flags::FIN | Flags::ACK,
        }
    }

    /// Replies answer another segment and are never retransmitted.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            SegmentKind::Ack | SegmentKind::SynAck | SegmentKind::FinAck
        )
    }
}

/// Transport segment.
///
/// ```text
/// 0       8       16      24      32
/// +-------+-------+-------+-------+
/// | dport | sport | 0     | flags |
/// +-------+-------+-------+-------+
/// | sequence number               |
/// +-------+-------+-------+-------+
/// | payload ...
/// +-------+-------+-------+-------+
/// ```
#[derive(Clone, Eq, PartialEq)]
pub struct Segment {
    dest: Endpoint,
    src: Endpoint,
    flags: Flags,
    seq: SequenceNumber,
    payload: Bytes,
}

impl Segment {
    /// Creates a data segment.
    pub fn new(dest: Endpoint, src: Endpoint, payload: Bytes) -> Self {
        Self::with_flags(dest, src, Flags::empty(), payload)
    }

    /// Creates a segment with the given flags and sequence number 0.
    pub fn with_flags(dest: Endpoint, src: Endpoint, flags: Flags, payload: Bytes) -> Self {
        Self {
            dest,
            src,
            flags,
            seq: 0,
            payload,
        }
    }

    /// Creates a data segment travelling along `key` from the local end.
    pub fn data(key: &ConnectionKey, payload: Bytes) -> Self {
        Self::new(key.remote(), key.local(), payload)
    }

    /// Creates a control segment of `kind` travelling along `key` from the
    /// local end.
    pub fn control(key: &ConnectionKey, kind: SegmentKind) -> Self {
        Self::with_flags(key.remote(), key.local(), kind.flags(), Bytes::new())
    }

    /// Creates a SYN.
    pub fn syn(key: &ConnectionKey) -> Self {
        Self::control(key, SegmentKind::Syn)
    }

    /// Creates a STP.
    pub fn stp(key: &ConnectionKey) -> Self {
        Self::control(key, SegmentKind::Stp)
    }

    /// Creates a FIN.
    pub fn fin(key: &ConnectionKey) -> Self {
        Self::control(key, SegmentKind::Fin)
    }

    /// Creates the reply of `kind` for this segment. The reply travels in the
    /// opposite direction and carries this segment's sequence number.
    pub fn reply(&self, kind: SegmentKind) -> Self {
        Self {
            dest: self.src,
            src: self.dest,
            flags: kind.flags(),
            seq: self.seq,
            payload: Bytes::new(),
        }
    }

    /// Creates the ACK for this segment.
    pub fn ack(&self) -> Self {
        self.reply(SegmentKind::Ack)
    }

    /// Creates the SYN-ACK for this SYN.
    pub fn ack_syn(&self) -> Self {
        self.reply(SegmentKind::SynAck)
    }

    /// Creates the FIN-ACK for this FIN.
    pub fn ack_fin(&self) -> Self {
        self.reply(SegmentKind::FinAck)
    }

    /// Destination host.
    pub fn dest_host(&self) -> HostId {
        self.dest.host
    }

    /// Destination port.
    pub fn dest_port(&self) -> Port {
        self.dest.port
    }

    /// Source host.
    pub fn src_host(&self) -> HostId {
        self.src.host
    }

    /// Source port.
    pub fn src_port(&self) -> Port {
        self.src.port
    }

    /// Flags.
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Classifies the segment.
    pub fn kind(&self) -> Option<SegmentKind> {
        SegmentKind::from_flags(self.flags)
    }

    /// Get sequence number.
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// Set sequence number.
    pub fn set_seq(&mut self, seq: SequenceNumber) {
        self.seq = seq;
    }

    /// Get the user data.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Key of the connection as seen by the receiver of this segment.
    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::from_endpoints(self.src, self.dest)
    }

    /// Key of the connection as seen by the sender of this segment.
    pub fn sender_key(&self) -> ConnectionKey {
        ConnectionKey::from_endpoints(self.dest, self.src)
    }

    /// Returns the segment with the first `consumed` payload bytes removed.
    pub fn shorten(&self, consumed: usize) -> Self {
        let mut segment = self.clone();
        segment.payload = self.payload.slice(consumed.min(self.payload.len())..);
        segment
    }

    /// Encodes the segment into a link frame.
    pub fn encode(&self) -> Result<Frame, MalformedSegment> {
        for port in [self.dest.port, self.src.port].iter() {
            if !is_valid_port(*port) {
                return Err(MalformedSegment::Port(*port));
            }
        }
        if self.payload.len() > MAX_PAYLOAD {
            return Err(MalformedSegment::TooLong(self.payload.len()));
        }
        let mut bytes = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        bytes.put_u8(self.dest.port);
        bytes.put_u8(self.src.port);
        bytes.put_u8(0);
        bytes.put_u8(self.flags.bits());
        bytes.put_u32(self.seq);
        bytes.put_slice(&self.payload);
        Ok(Frame::new(self.dest.host, self.src.host, bytes.freeze())?)
    }

    /// Decodes a segment from a link frame.
    pub fn decode(frame: &Frame) -> Result<Self, MalformedSegment> {
        let data = frame.contents();
        if data.len() < HEADER_LEN {
            return Err(MalformedSegment::Truncated(data.len()));
        }
        if data[2] != 0 {
            return Err(MalformedSegment::Reserved(data[2]));
        }
        let flags = Flags::from_bits(data[3]).ok_or(MalformedSegment::Flags(data[3]))?;
        for port in data[..2].iter() {
            if !is_valid_port(*port) {
                return Err(MalformedSegment::Port(*port));
            }
        }
        Ok(Self {
            dest: Endpoint::new(frame.dest(), data[0]),
            src: Endpoint::new(frame.src(), data[1]),
            flags,
            seq: BigEndian::read_u32(&data[4..HEADER_LEN]),
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..]),
        })
    }

    /// Decodes a segment from a raw link frame.
    pub fn parse(raw: &[u8]) -> Result<Self, MalformedSegment> {
        Self::decode(&Frame::decode(raw)?)
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Segment")
            .field("src", &format_args!("{}:{}", self.src.host, self.src.port))
            .field("dest", &format_args!("{}:{}", self.dest.host, self.dest.port))
            .field("flags", &self.flags)
            .field("seq", &self.seq)
            .field("payload", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use link::FRAME_LEN;

    fn key() -> ConnectionKey {
        ConnectionKey::new(2, 7, 1, 3)
    }

    #[test]
    fn test_layout() {
        let mut segment = Segment::data(&key(), Bytes::from_static(b"hi"));
        segment.set_seq(0x0102_0304);
        let frame = segment.encode().unwrap();
        assert_eq!(frame.dest(), 2);
        assert_eq!(frame.src(), 1);
        assert_eq!(frame.contents(), &[7, 3, 0, 0, 1, 2, 3, 4, b'h', b'i']);
    }

    #[test]
    fn test_round_trip() {
        let kinds = [
            SegmentKind::Data,
            SegmentKind::Syn,
            SegmentKind::SynAck,
            SegmentKind::Ack,
            SegmentKind::Stp,
            SegmentKind::Fin,
            SegmentKind::FinAck,
        ];
        let payload = Bytes::from(vec![0xab; MAX_PAYLOAD]);
        for (i, kind) in kinds.iter().enumerate() {
            let mut segment = Segment::with_flags(
                Endpoint::new(4, 127),
                Endpoint::new(5, 0),
                kind.flags(),
                payload.slice(..i),
            );
            segment.set_seq(u32::MAX - i as u32);
            let frame = segment.encode().unwrap();
            assert!(frame.encode().len() <= FRAME_LEN);
            let decoded = Segment::parse(&frame.encode()).unwrap();
            assert_eq!(decoded, segment);
            assert_eq!(decoded.kind(), Some(*kind));
        }
    }

    #[test]
    fn test_decode_errors() {
        let frame = |contents: &'static [u8]| Frame::new(1, 2, Bytes::from_static(contents)).unwrap();
        assert!(matches!(
            Segment::decode(&frame(&[0, 0, 0, 0, 0, 0, 0])),
            Err(MalformedSegment::Truncated(7))
        ));
        assert!(matches!(
            Segment::decode(&frame(&[0, 0, 1, 0, 0, 0, 0, 0])),
            Err(MalformedSegment::Reserved(1))
        ));
        assert!(matches!(
            Segment::decode(&frame(&[0, 0, 0, 0x10, 0, 0, 0, 0])),
            Err(MalformedSegment::Flags(0x10))
        ));
        assert!(matches!(
            Segment::decode(&frame(&[200, 0, 0, 0, 0, 0, 0, 0])),
            Err(MalformedSegment::Port(200))
        ));
        // Declared link length differs from the bytes that follow.
        assert!(matches!(
            Segment::parse(&[2, 1, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(MalformedSegment::Frame(_))
        ));
    }

    #[test]
    fn test_encode_errors() {
        let segment = Segment::data(&ConnectionKey::new(2, 128, 1, 3), Bytes::new());
        assert!(matches!(segment.encode(), Err(MalformedSegment::Port(128))));
        let segment = Segment::data(&key(), Bytes::from(vec![0; MAX_PAYLOAD + 1]));
        assert!(matches!(segment.encode(), Err(MalformedSegment::TooLong(21))));
    }

    #[test]
    fn test_replies() {
        let mut fin = Segment::fin(&key());
        fin.set_seq(9);
        let reply = fin.ack_fin();
        assert_eq!(reply.kind(), Some(SegmentKind::FinAck));
        assert_eq!(reply.seq(), 9);
        assert_eq!(reply.key(), fin.sender_key());
        assert_eq!(fin.key(), key().mirror());

        let syn = Segment::syn(&key());
        assert_eq!(syn.ack_syn().flags(), Flags::SYN | Flags::ACK);
        assert_eq!(syn.ack().kind(), Some(SegmentKind::Ack));
        assert_eq!(SegmentKind::from_flags(Flags::SYN | Flags::FIN), None);
        assert_eq!(format!("{:?}", Flags::FIN | Flags::ACK), "ACK|FIN");
    }

    #[test]
    fn test_shorten() {
        let segment = Segment::data(&key(), Bytes::from_static(b"hello world"));
        let rest = segment.shorten(6);
        assert_eq!(rest.payload(), b"world");
        assert_eq!(segment.shorten(20).payload(), b"");
    }
}
