/**
 * ffi/types.rs
 *
 * Common FFI types and structures
 */

use crate::coordinator::ConnectionType;

/// Opaque handle for a rendezvous client
#[repr(C)]
pub struct RendezvousClientHandle {
    _private: [u8; 0],
}

/// Connection type (matches coordinator::ConnectionType)
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RendezvousConnectionType {
    Unknown = 0,
    Isolated = 1,
    Direct = 2,
    Stun = 3,
}

impl From<ConnectionType> for RendezvousConnectionType {
    fn from(value: ConnectionType) -> Self {
        match value {
            ConnectionType::Unknown => RendezvousConnectionType::Unknown,
            ConnectionType::Isolated => RendezvousConnectionType::Isolated,
            ConnectionType::Direct => RendezvousConnectionType::Direct,
            ConnectionType::Stun => RendezvousConnectionType::Stun,
        }
    }
}

/// Status reported by rendezvous_take_join_result
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JoinStatus {
    /// No finished join is waiting
    None = 0,
    Connected = 1,
    Failed = 2,
}
