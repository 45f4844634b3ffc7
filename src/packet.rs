use crate::buffer::Buffer;

/// Fixed wire header size. Byte 0 packs the version (bits 0-3), payload
/// encoding (bits 4-6) and a reserved marker bit (bit 7, always zero on
/// send); bytes 1-4 carry the big-endian body length.
pub const HEADER_SIZE: usize = 5;

/// Protocol version stamped into outgoing headers.
pub const VERSION: u8 = 1;

/// Default upper bound for a declared body length. A header above the bound
/// is malformed and the connection carrying it must close.
pub const DEFAULT_MAX_BODY: u32 = 64 * 1024 * 1024;

/// Envelope encodings carried in the header's payload bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadType {
    Json = 0,
    Binary = 1,
}

impl PayloadType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(PayloadType::Json),
            1 => Some(PayloadType::Binary),
            _ => None,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// One decoded frame. `payload` keeps the raw header bits so a dispatcher
/// can answer unknown encodings with a protocol error.
#[derive(Debug)]
pub struct Packet {
    pub version: u8,
    pub payload: u8,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum ParseOutcome {
    /// A complete frame; header and body were consumed from the buffer.
    Packet(Packet),
    /// Not enough buffered bytes yet. Nothing was consumed.
    Incomplete,
    /// Declared body length exceeds the allowed maximum (value carried).
    Malformed(u32),
}

impl Packet {
    pub fn payload_type(&self) -> Option<PayloadType> {
        PayloadType::from_bits(self.payload)
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// A frame is complete once `unread >= HEADER_SIZE + length`. Incomplete
    /// frames leave the buffer untouched so later receives can extend them.
    pub fn try_parse(buf: &mut Buffer, max_body: u32) -> ParseOutcome {
        if buf.unread() < HEADER_SIZE {
            return ParseOutcome::Incomplete;
        }
        let head = match buf.peek_u8(0) {
            Some(b) => b,
            None => return ParseOutcome::Incomplete,
        };
        let length = match buf.peek_u32(1) {
            Some(v) => v,
            None => return ParseOutcome::Incomplete,
        };
        if length > max_body {
            return ParseOutcome::Malformed(length);
        }
        if buf.unread() < HEADER_SIZE + length as usize {
            return ParseOutcome::Incomplete;
        }
        buf.consume(HEADER_SIZE);
        let body = buf.readable_slice()[..length as usize].to_vec();
        buf.consume(length as usize);
        ParseOutcome::Packet(Packet {
            version: head & 0x0f,
            payload: (head >> 4) & 0x07,
            body,
        })
    }

    /// Appends one framed message to `out`.
    pub fn encode_into(payload: PayloadType, body: &[u8], out: &mut Buffer) {
        debug_assert!(body.len() <= u32::MAX as usize);
        out.write_u8((payload.bits() << 4) | (VERSION & 0x0f));
        out.write_u32(body.len() as u32);
        out.append(body);
    }

    pub fn encode(payload: PayloadType, body: &[u8]) -> Vec<u8> {
        let mut out = Buffer::with_capacity(HEADER_SIZE + body.len());
        Self::encode_into(payload, body, &mut out);
        out.readable_slice().to_vec()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let mut buf = Buffer::new();
        Packet::encode_into(PayloadType::Binary, b"ping", &mut buf);
        assert_eq!(buf.unread(), HEADER_SIZE + 4);
        match Packet::try_parse(&mut buf, DEFAULT_MAX_BODY) {
            ParseOutcome::Packet(pkt) => {
                assert_eq!(pkt.version, VERSION);
                assert_eq!(pkt.payload_type(), Some(PayloadType::Binary));
                assert_eq!(pkt.body, b"ping");
            }
            other => panic!("expected packet, got {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_leave_buffer_untouched() {
        let framed = Packet::encode(PayloadType::Json, b"hello");
        let mut buf = Buffer::new();
        for cut in 0..framed.len() {
            buf.clear();
            buf.append(&framed[..cut]);
            let before = buf.unread();
            assert!(matches!(
                Packet::try_parse(&mut buf, DEFAULT_MAX_BODY),
                ParseOutcome::Incomplete
            ));
            assert_eq!(buf.unread(), before);
        }
    }

    #[test]
    fn drains_multiple_frames() {
        let mut buf = Buffer::new();
        Packet::encode_into(PayloadType::Json, b"one", &mut buf);
        Packet::encode_into(PayloadType::Json, b"two", &mut buf);
        Packet::encode_into(PayloadType::Json, b"", &mut buf);
        let mut bodies = Vec::new();
        loop {
            match Packet::try_parse(&mut buf, DEFAULT_MAX_BODY) {
                ParseOutcome::Packet(pkt) => bodies.push(pkt.body),
                ParseOutcome::Incomplete => break,
                ParseOutcome::Malformed(n) => panic!("malformed length {}", n),
            }
        }
        assert_eq!(bodies, vec![b"one".to_vec(), b"two".to_vec(), Vec::new()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_length_is_malformed() {
        let mut buf = Buffer::new();
        buf.write_u8(VERSION);
        buf.write_u32(1024 + 1);
        assert!(matches!(
            Packet::try_parse(&mut buf, 1024),
            ParseOutcome::Malformed(1025)
        ));
    }

    #[test]
    fn unknown_payload_bits_are_carried_raw() {
        let mut buf = Buffer::new();
        buf.write_u8((5 << 4) | VERSION);
        buf.write_u32(0);
        match Packet::try_parse(&mut buf, DEFAULT_MAX_BODY) {
            ParseOutcome::Packet(pkt) => {
                assert_eq!(pkt.payload, 5);
                assert_eq!(pkt.payload_type(), None);
            }
            other => panic!("expected packet, got {:?}", other),
        }
    }
}
