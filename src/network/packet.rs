/**
 * network/packet.rs
 *
 * Typed packet builder/reader
 *
 * Frame layout (all integers big-endian):
 *   u16  total frame size, including these two bytes
 *   u8   packet type
 *   ...  payload
 *
 * Strings are a u16 byte length followed by UTF-8 bytes, with any NUL
 * bytes removed before sending.
 */

use std::fmt;

/// Size of the length prefix
pub const SIZE_LEN: usize = 2;

/// Length prefix plus type byte
pub const HEADER_LEN: usize = SIZE_LEN + 1;

/// Largest frame the length prefix can describe
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Packet encode/decode errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Read past the end of the payload
    Truncated { needed: usize, available: usize },
    /// Frame would exceed MAX_PACKET_SIZE
    TooLarge(usize),
    /// Frame header declares a size smaller than the header itself
    InvalidSize(usize),
    InvalidUtf8,
    UnknownType(u8),
    UnsupportedGameInfoVersion(u8),
    ProtocolVersion { expected: u8, received: u8 },
    InvalidValue(&'static str),
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::Truncated { needed, available } => {
                write!(f, "Packet truncated: needed {} bytes, {} available", needed, available)
            }
            PacketError::TooLarge(size) => {
                write!(f, "Packet too large: {} bytes (max {})", size, MAX_PACKET_SIZE)
            }
            PacketError::InvalidSize(size) => write!(f, "Invalid packet size: {}", size),
            PacketError::InvalidUtf8 => write!(f, "String is not valid UTF-8"),
            PacketError::UnknownType(t) => write!(f, "Unknown packet type: {}", t),
            PacketError::UnsupportedGameInfoVersion(v) => {
                write!(f, "Unsupported game info version: {}", v)
            }
            PacketError::ProtocolVersion { expected, received } => write!(
                f,
                "Protocol version mismatch: expected {}, received {}",
                expected, received
            ),
            PacketError::InvalidValue(what) => write!(f, "Invalid value for {}", what),
        }
    }
}

impl std::error::Error for PacketError {}

/// A single framed message
#[derive(Debug, Clone)]
pub struct Packet {
    buffer: Vec<u8>,
    pos: usize,
}

impl Packet {
    /// Start an outgoing packet of the given type
    pub fn new(packet_type: u8) -> Self {
        let mut buffer = Vec::with_capacity(64);
        buffer.extend_from_slice(&[0, 0]);
        buffer.push(packet_type);
        Self { buffer, pos: HEADER_LEN }
    }

    /// Wrap a complete received frame (length prefix included)
    pub fn from_frame(frame: Vec<u8>) -> Result<Self, PacketError> {
        if frame.len() < HEADER_LEN {
            return Err(PacketError::InvalidSize(frame.len()));
        }
        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        if declared != frame.len() {
            return Err(PacketError::InvalidSize(declared));
        }
        Ok(Self { buffer: frame, pos: HEADER_LEN })
    }

    pub fn packet_type(&self) -> u8 {
        self.buffer[SIZE_LEN]
    }

    /// Current frame size, header included
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Unread payload bytes
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Finalise the length prefix and return the wire bytes
    pub fn into_frame(mut self) -> Result<Vec<u8>, PacketError> {
        let size = self.buffer.len();
        if size > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(size));
        }
        self.buffer[..SIZE_LEN].copy_from_slice(&(size as u16).to_be_bytes());
        Ok(self.buffer)
    }

    pub fn send_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn send_bool(&mut self, value: bool) {
        self.send_u8(value as u8);
    }

    pub fn send_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn send_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn send_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Length-prefixed string; NUL bytes never reach the wire
    pub fn send_string(&mut self, value: &str) {
        let clean: Vec<u8> = value.bytes().filter(|b| *b != 0).take(u16::MAX as usize).collect();
        let clean = match std::str::from_utf8(&clean) {
            Ok(_) => clean,
            // Cut inside a multi-byte char; drop the tail.
            Err(e) => clean[..e.valid_up_to()].to_vec(),
        };
        self.send_u16(clean.len() as u16);
        self.buffer.extend_from_slice(&clean);
    }

    fn take(&mut self, count: usize) -> Result<&[u8], PacketError> {
        let available = self.remaining();
        if count > available {
            return Err(PacketError::Truncated { needed: count, available });
        }
        let start = self.pos;
        self.pos += count;
        Ok(&self.buffer[start..start + count])
    }

    pub fn recv_u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    pub fn recv_bool(&mut self) -> Result<bool, PacketError> {
        Ok(self.recv_u8()? != 0)
    }

    pub fn recv_u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn recv_u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn recv_bytes<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(self.take(N)?);
        Ok(bytes)
    }

    /// Read a string, keeping at most `max_len` bytes (cut on a char boundary)
    pub fn recv_string(&mut self, max_len: usize) -> Result<String, PacketError> {
        let len = self.recv_u16()? as usize;
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| PacketError::InvalidUtf8)?;

        let mut end = s.len().min(max_len);
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        Ok(s[..end].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header() {
        let mut p = Packet::new(7);
        p.send_u16(0x0102);
        let frame = p.into_frame().unwrap();
        assert_eq!(frame, vec![0, 5, 7, 1, 2]);
    }

    #[test]
    fn test_typed_fields() {
        let mut p = Packet::new(1);
        p.send_u8(200);
        p.send_bool(true);
        p.send_u32(0xDEADBEEF);
        p.send_string("hello");
        p.send_bytes(&[9; 16]);

        let mut r = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        assert_eq!(r.packet_type(), 1);
        assert_eq!(r.recv_u8().unwrap(), 200);
        assert!(r.recv_bool().unwrap());
        assert_eq!(r.recv_u32().unwrap(), 0xDEADBEEF);
        assert_eq!(r.recv_string(64).unwrap(), "hello");
        assert_eq!(r.recv_bytes::<16>().unwrap(), [9; 16]);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_strings_drop_nul_bytes() {
        let mut p = Packet::new(1);
        p.send_string("a\0b");
        let mut r = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        assert_eq!(r.recv_string(64).unwrap(), "ab");
    }

    #[test]
    fn test_string_budget_respects_char_boundary() {
        let mut p = Packet::new(1);
        p.send_string("aé");
        let mut r = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        // 'é' is two bytes; a 2-byte budget must not split it.
        assert_eq!(r.recv_string(2).unwrap(), "a");
    }

    #[test]
    fn test_truncated_read() {
        let mut p = Packet::new(1);
        p.send_u8(1);
        let mut r = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        assert_eq!(
            r.recv_u32(),
            Err(PacketError::Truncated { needed: 4, available: 1 })
        );
    }

    #[test]
    fn test_rejects_oversized_packet() {
        let mut p = Packet::new(1);
        p.send_bytes(&vec![0u8; MAX_PACKET_SIZE]);
        assert!(matches!(p.into_frame(), Err(PacketError::TooLarge(_))));
    }

    #[test]
    fn test_rejects_mismatched_frame_size() {
        assert!(Packet::from_frame(vec![0, 9, 1]).is_err());
        assert!(Packet::from_frame(vec![0, 2]).is_err());
    }
}
