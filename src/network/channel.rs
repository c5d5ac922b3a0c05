/**
 * network/channel.rs
 *
 * Framed packet channel over a non-blocking stream socket
 */

use super::packet::{Packet, PacketError, HEADER_LEN, SIZE_LEN};
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;

const READ_CHUNK: usize = 4096;

/// Outcome of draining the send queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The connection is closed
    Closed,
    /// The socket accepted nothing
    NoneSent,
    /// Some bytes went out; more remain queued
    PartlySent,
    /// The queue is empty
    AllSent,
}

/// Channel errors
#[derive(Debug)]
pub enum ChannelError {
    /// The channel was closed, by the peer or after an earlier error
    Closed,
    Malformed(PacketError),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::Closed => write!(f, "Connection closed"),
            ChannelError::Malformed(e) => write!(f, "Malformed packet: {}", e),
        }
    }
}

impl std::error::Error for ChannelError {}

/// Length-prefixed message channel
///
/// Partial writes and partial frames are buffered between calls. Any I/O
/// error closes the channel for good.
pub struct PacketChannel<S = TcpStream> {
    stream: Option<S>,
    send_queue: VecDeque<Vec<u8>>,
    send_offset: usize,
    recv_buffer: Vec<u8>,
}

impl PacketChannel<TcpStream> {
    /// Take ownership of a connected socket and switch it to non-blocking
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S: Read + Write> PacketChannel<S> {
    /// Wrap an already non-blocking stream
    pub fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
            send_queue: VecDeque::new(),
            send_offset: 0,
            recv_buffer: Vec::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    pub fn stream(&self) -> Option<&S> {
        self.stream.as_ref()
    }

    pub fn has_send_queue(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Drop the socket and all buffered data
    pub fn close(&mut self) {
        self.stream = None;
        self.send_queue.clear();
        self.send_offset = 0;
        self.recv_buffer.clear();
    }

    /// Queue a packet for the next `send_packets`
    pub fn send_packet(&mut self, packet: Packet) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let frame = packet.into_frame().map_err(ChannelError::Malformed)?;
        self.send_queue.push_back(frame);
        Ok(())
    }

    /// Write as much of the queue as the socket will take right now
    pub fn send_packets(&mut self) -> SendStatus {
        let Some(stream) = self.stream.as_mut() else {
            return SendStatus::Closed;
        };

        let mut sent_any = false;
        while let Some(front) = self.send_queue.front() {
            match stream.write(&front[self.send_offset..]) {
                Ok(0) => {
                    self.close();
                    return SendStatus::Closed;
                }
                Ok(n) => {
                    sent_any = true;
                    self.send_offset += n;
                    if self.send_offset == front.len() {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return if sent_any { SendStatus::PartlySent } else { SendStatus::NoneSent };
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[channel] send failed: {}", e);
                    self.close();
                    return SendStatus::Closed;
                }
            }
        }

        SendStatus::AllSent
    }

    /// Return one complete packet, `Ok(None)` if none has fully arrived yet
    pub fn receive_packet(&mut self) -> Result<Option<Packet>, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        loop {
            match self.take_frame() {
                Ok(Some(frame)) => {
                    return Packet::from_frame(frame).map(Some).map_err(|e| {
                        self.close();
                        ChannelError::Malformed(e)
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    self.close();
                    return Err(ChannelError::Malformed(e));
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                return Err(ChannelError::Closed);
            };
            let mut chunk = [0u8; READ_CHUNK];
            match stream.read(&mut chunk) {
                Ok(0) => {
                    if !self.recv_buffer.is_empty() {
                        log::debug!(
                            "[channel] peer closed with {} bytes of a partial frame",
                            self.recv_buffer.len()
                        );
                    }
                    self.close();
                    return Err(ChannelError::Closed);
                }
                Ok(n) => self.recv_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[channel] receive failed: {}", e);
                    self.close();
                    return Err(ChannelError::Closed);
                }
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, PacketError> {
        if self.recv_buffer.len() < SIZE_LEN {
            return Ok(None);
        }
        let size = u16::from_be_bytes([self.recv_buffer[0], self.recv_buffer[1]]) as usize;
        if size < HEADER_LEN {
            return Err(PacketError::InvalidSize(size));
        }
        if self.recv_buffer.len() < size {
            return Ok(None);
        }
        Ok(Some(self.recv_buffer.drain(..size).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory stream: reads from a script of chunks, writes accept at
    /// most `write_limit` bytes per call and then block.
    struct ScriptedStream {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: Vec<u8>,
        write_budget: usize,
    }

    impl ScriptedStream {
        fn new(reads: Vec<io::Result<Vec<u8>>>, write_budget: usize) -> Self {
            Self { reads: reads.into(), written: Vec::new(), write_budget }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(data)) => {
                    let mut cursor = Cursor::new(data);
                    cursor.read(buf)
                }
                Some(Err(e)) => Err(e),
                None => Err(io::Error::from(ErrorKind::WouldBlock)),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_budget == 0 {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.write_budget);
            self.write_budget -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(packet_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut p = Packet::new(packet_type);
        p.send_bytes(payload);
        p.into_frame().unwrap()
    }

    #[test]
    fn test_partial_frames_are_buffered() {
        let data = frame(3, b"abcdef");
        let (head, tail) = data.split_at(4);
        let stream = ScriptedStream::new(vec![Ok(head.to_vec())], 0);
        let mut channel = PacketChannel::new(stream);

        assert!(channel.receive_packet().unwrap().is_none());

        channel.stream.as_mut().unwrap().reads.push_back(Ok(tail.to_vec()));
        let packet = channel.receive_packet().unwrap().unwrap();
        assert_eq!(packet.packet_type(), 3);
        assert_eq!(packet.remaining(), 6);
    }

    #[test]
    fn test_two_frames_in_one_read() {
        let mut data = frame(1, b"x");
        data.extend(frame(2, b"yz"));
        let mut channel = PacketChannel::new(ScriptedStream::new(vec![Ok(data)], 0));

        assert_eq!(channel.receive_packet().unwrap().unwrap().packet_type(), 1);
        assert_eq!(channel.receive_packet().unwrap().unwrap().packet_type(), 2);
        assert!(channel.receive_packet().unwrap().is_none());
    }

    #[test]
    fn test_truncated_frame_then_close_reports_closed() {
        let data = frame(1, b"0123456789");
        let stream = ScriptedStream::new(vec![Ok(data[..5].to_vec()), Ok(Vec::new())], 0);
        let mut channel = PacketChannel::new(stream);

        assert!(matches!(channel.receive_packet(), Err(ChannelError::Closed)));
        assert!(channel.is_closed());
        assert!(matches!(channel.receive_packet(), Err(ChannelError::Closed)));
        assert_eq!(channel.send_packets(), SendStatus::Closed);
    }

    #[test]
    fn test_invalid_size_closes_channel() {
        let stream = ScriptedStream::new(vec![Ok(vec![0, 1, 0])], 0);
        let mut channel = PacketChannel::new(stream);
        assert!(matches!(channel.receive_packet(), Err(ChannelError::Malformed(_))));
        assert!(channel.is_closed());
    }

    #[test]
    fn test_send_statuses() {
        let mut channel = PacketChannel::new(ScriptedStream::new(Vec::new(), 0));
        assert_eq!(channel.send_packets(), SendStatus::AllSent);

        let mut p = Packet::new(1);
        p.send_bytes(&[0; 10]);
        channel.send_packet(p).unwrap();
        assert_eq!(channel.send_packets(), SendStatus::NoneSent);

        channel.stream.as_mut().unwrap().write_budget = 5;
        assert_eq!(channel.send_packets(), SendStatus::PartlySent);
        assert!(channel.has_send_queue());

        channel.stream.as_mut().unwrap().write_budget = 100;
        assert_eq!(channel.send_packets(), SendStatus::AllSent);
        assert!(!channel.has_send_queue());
        assert_eq!(channel.stream().unwrap().written.len(), 13);
    }

    #[test]
    fn test_write_error_closes() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(ErrorKind::ConnectionReset))
            }
        }
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::from(ErrorKind::BrokenPipe))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut channel = PacketChannel::new(Broken);
        channel.send_packet(Packet::new(1)).unwrap();
        assert_eq!(channel.send_packets(), SendStatus::Closed);
        assert!(matches!(channel.send_packet(Packet::new(1)), Err(ChannelError::Closed)));
    }
}
