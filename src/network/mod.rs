/**
 * network/mod.rs
 *
 * Transport plumbing:
 * - Lazily resolved addresses
 * - Typed packets and framed, non-blocking packet channels
 * - Non-blocking outbound connects on a worker pool
 */

mod address;
mod channel;
mod packet;
mod tcp_connect;

pub use address::{supported_families, Family, NetworkAddress, ServerAddress};
pub use channel::{ChannelError, PacketChannel, SendStatus};
pub use packet::{Packet, PacketError, HEADER_LEN, MAX_PACKET_SIZE};
pub use tcp_connect::{
    ConnectId, ConnectOutcome, ConnectorPool, DialOptions, Dialer, TcpConnectError, MAX_CONNECT_WORKERS,
};
