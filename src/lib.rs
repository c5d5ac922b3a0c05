#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod coordinator;
pub mod ffi;
pub mod game_info;
pub mod game_list;
pub mod network;

pub use coordinator::{
    ConnectionType, CoordinatorClient, CoordinatorConfig, CoordinatorEvent, JoinError, JoinResult, Visibility,
};
pub use game_info::GameInfo;
pub use game_list::{GameList, GameListEntry};
pub use network::{NetworkAddress, ServerAddress};
