//! Packet codec. Compact big-endian layout for small-MTU links:
//!
//! `version u8 | type u8 | ttl u8 | timestamp u64 | flags u8 | payload_len u16 |
//! sender 8 | [recipient 8] | payload | [signature 64]`

use crate::identity::{PeerId, SIGNATURE_SIZE};
use crate::protocol::{MessageType, Packet, PROTOCOL_VERSION};

/// Fixed header before the sender id.
pub const HEADER_SIZE: usize = 14;
const SENDER_ID_SIZE: usize = 8;
const RECIPIENT_ID_SIZE: usize = 8;

/// Worst-case bytes a frame spends outside its payload.
pub const MAX_OVERHEAD: usize = HEADER_SIZE + SENDER_ID_SIZE + RECIPIENT_ID_SIZE + SIGNATURE_SIZE;

const FLAG_HAS_RECIPIENT: u8 = 0x01;
const FLAG_HAS_SIGNATURE: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_HAS_RECIPIENT | FLAG_HAS_SIGNATURE;

/// Encode a packet into one frame.
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    if let Some(sig) = &packet.signature {
        if sig.len() != SIGNATURE_SIZE {
            return Err(FrameEncodeError::SignatureLength(sig.len()));
        }
    }
    encode_fields(packet, packet.ttl, packet.signature.as_deref())
}

/// Bytes covered by a packet signature: the frame with ttl zeroed and no signature,
/// so relays can decrement ttl without invalidating it.
pub fn signing_bytes(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    encode_fields(packet, 0, None)
}

fn encode_fields(
    packet: &Packet,
    ttl: u8,
    signature: Option<&[u8]>,
) -> Result<Vec<u8>, FrameEncodeError> {
    let payload_len =
        u16::try_from(packet.payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    let mut flags = 0u8;
    if packet.recipient_id.is_some() {
        flags |= FLAG_HAS_RECIPIENT;
    }
    if signature.is_some() {
        flags |= FLAG_HAS_SIGNATURE;
    }
    let mut out = Vec::with_capacity(MAX_OVERHEAD + packet.payload.len());
    out.push(packet.version);
    out.push(packet.message_type.as_u8());
    out.push(ttl);
    out.extend_from_slice(&packet.timestamp.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&payload_len.to_be_bytes());
    out.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = &packet.recipient_id {
        out.extend_from_slice(recipient.as_bytes());
    }
    out.extend_from_slice(&packet.payload);
    if let Some(sig) = signature {
        out.extend_from_slice(sig);
    }
    Ok(out)
}

/// Error encoding a packet (payload too large for the length field, bad signature length).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload too large for frame")]
    TooLarge,
    #[error("signature must be {SIGNATURE_SIZE} bytes, got {0}")]
    SignatureLength(usize),
}

/// Decode exactly one frame. Any inconsistency is an error; callers drop the frame.
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, FrameDecodeError> {
    let mut r = Reader::new(bytes);
    let version = r.u8()?;
    if version != PROTOCOL_VERSION {
        return Err(FrameDecodeError::Version(version));
    }
    let code = r.u8()?;
    let message_type = MessageType::from_u8(code).ok_or(FrameDecodeError::UnknownType(code))?;
    let ttl = r.u8()?;
    let timestamp = u64::from_be_bytes(r.array::<8>()?);
    let flags = r.u8()?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameDecodeError::Flags(flags));
    }
    let payload_len = u16::from_be_bytes(r.array::<2>()?) as usize;
    let sender_id = PeerId::from_bytes(r.array::<8>()?);
    let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
        Some(PeerId::from_bytes(r.array::<8>()?))
    } else {
        None
    };
    let payload = r.take(payload_len)?.to_vec();
    let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
        Some(r.take(SIGNATURE_SIZE)?.to_vec())
    } else {
        None
    };
    if r.remaining() != 0 {
        return Err(FrameDecodeError::TrailingBytes(r.remaining()));
    }
    Ok(Packet {
        version,
        message_type,
        sender_id,
        recipient_id,
        timestamp,
        payload,
        signature,
        ttl,
    })
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("truncated frame")]
    Truncated,
    #[error("unsupported version {0}")]
    Version(u8),
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown flags {0:#04x}")]
    Flags(u8),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameDecodeError> {
        if n > self.remaining() {
            return Err(FrameDecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, FrameDecodeError> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FrameDecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_message() -> Packet {
        Packet::new(
            MessageType::Message,
            PeerId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]),
            None,
            1_700_000_000_000,
            b"hi".to_vec(),
            7,
        )
    }

    #[test]
    fn roundtrip_message_scenario() {
        let p = sample_message();
        let frame = encode_packet(&p).unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 8 + 2);
        let decoded = decode_packet(&frame).unwrap();
        assert_eq!(decoded, p);
        assert_eq!(decoded.ttl, 7);
        assert_eq!(decoded.payload, b"hi");
        assert_eq!(decoded.message_type, MessageType::Message);
    }

    #[test]
    fn roundtrip_with_recipient_and_signature() {
        let mut p = sample_message();
        p.recipient_id = Some(PeerId::BROADCAST);
        p.signature = Some(vec![9u8; SIGNATURE_SIZE]);
        let frame = encode_packet(&p).unwrap();
        assert_eq!(frame.len(), MAX_OVERHEAD + 2);
        assert_eq!(decode_packet(&frame).unwrap(), p);
    }

    #[test]
    fn truncated_frames_fail() {
        let frame = encode_packet(&sample_message()).unwrap();
        for cut in 0..frame.len() {
            assert_eq!(
                decode_packet(&frame[..cut]),
                Err(FrameDecodeError::Truncated),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn wrong_version_and_type_fail() {
        let mut frame = encode_packet(&sample_message()).unwrap();
        frame[0] = 2;
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::Version(2)));
        frame[0] = PROTOCOL_VERSION;
        frame[1] = 0x42;
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::UnknownType(0x42)));
    }

    #[test]
    fn declared_length_beyond_buffer_fails() {
        let mut frame = encode_packet(&sample_message()).unwrap();
        frame[12] = 0xFF;
        frame[13] = 0xFF;
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::Truncated));
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut frame = encode_packet(&sample_message()).unwrap();
        frame.push(0);
        assert_eq!(decode_packet(&frame), Err(FrameDecodeError::TrailingBytes(1)));
    }

    #[test]
    fn bad_signature_length_rejected_on_encode() {
        let mut p = sample_message();
        p.signature = Some(vec![0u8; 10]);
        assert!(matches!(
            encode_packet(&p),
            Err(FrameEncodeError::SignatureLength(10))
        ));
    }

    #[test]
    fn signing_bytes_ignore_ttl() {
        let p = sample_message();
        let relayed = p.relayed().unwrap();
        assert_eq!(signing_bytes(&p).unwrap(), signing_bytes(&relayed).unwrap());
    }

    fn arb_packet() -> impl Strategy<Value = Packet> {
        (
            1u8..=0x0C,
            any::<[u8; 8]>(),
            proptest::option::of(any::<[u8; 8]>()),
            any::<u64>(),
            proptest::collection::vec(any::<u8>(), 0..600),
            proptest::option::of(proptest::collection::vec(any::<u8>(), SIGNATURE_SIZE)),
            0u8..=7,
        )
            .prop_map(|(code, sender, recipient, timestamp, payload, signature, ttl)| Packet {
                version: PROTOCOL_VERSION,
                message_type: MessageType::from_u8(code).unwrap(),
                sender_id: PeerId::from_bytes(sender),
                recipient_id: recipient.map(PeerId::from_bytes),
                timestamp,
                payload,
                signature,
                ttl,
            })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(p in arb_packet()) {
            let frame = encode_packet(&p).unwrap();
            prop_assert_eq!(decode_packet(&frame).unwrap(), p);
        }

        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = decode_packet(&bytes);
        }
    }
}
