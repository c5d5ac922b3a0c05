/**
 * coordinator/mod.rs
 *
 * Rendezvous service client:
 * - Registration and periodic updates of a hosted game
 * - Listing passes into the local game list
 * - Join orchestration (direct connect, STUN-assisted hole punching)
 */

mod attempt;
mod client;
pub mod protocol;
mod stun;
mod types;

pub use attempt::{AttemptState, AttemptTable, ConnectAttempt, DialKind, JoinCallback, JoinError, JoinResult};
pub use client::CoordinatorClient;
pub use stun::{StunClient, StunState};
pub use types::{
    Backoff, ConnectionType, CoordinatorConfig, CoordinatorEvent, Visibility, COORDINATOR_PORT,
    DEFAULT_COORDINATOR_SERVER, DEFAULT_STUN_SERVER, STUN_PORT,
};
