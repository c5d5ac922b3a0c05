/**
 * game_list.rs
 *
 * Locally known games, refreshed by listing passes
 *
 * Every listing pass bumps the list version; entries the pass touches are
 * stamped with it. When the pass ends, entries stamped with an older
 * version (and not added manually) are removed.
 */

use crate::game_info::{is_compatible_version, GameInfo};
use crate::network::ServerAddress;

#[derive(Debug, Clone)]
pub struct GameListEntry {
    pub address: ServerAddress,
    pub info: GameInfo,
    /// List version of the pass that last touched this entry
    pub version: u32,
    pub online: bool,
    /// Added by the user; survives listing passes
    pub manually: bool,
    pub version_compatible: bool,
    pub compatible: bool,
}

impl GameListEntry {
    fn new(address: ServerAddress, version: u32) -> Self {
        Self {
            address,
            info: GameInfo::default(),
            version,
            online: false,
            manually: false,
            version_compatible: false,
            compatible: false,
        }
    }
}

/// Ordered list of known games
#[derive(Debug, Default)]
pub struct GameList {
    entries: Vec<GameListEntry>,
    version: u32,
}

impl GameList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current list version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Start a new listing pass
    pub fn begin_pass(&mut self) -> u32 {
        self.version = self.version.wrapping_add(1);
        self.version
    }

    /// Find or add the entry for `address`, stamped with the current version.
    ///
    /// Direct addresses pointing at the any-address are refused.
    pub fn add_item(&mut self, address: ServerAddress) -> Option<&mut GameListEntry> {
        if let ServerAddress::Direct(direct) = &address {
            if direct.is_unspecified_host() {
                return None;
            }
        }

        let version = self.version;
        match self.entries.iter().position(|e| e.address == address) {
            Some(index) => {
                let entry = &mut self.entries[index];
                entry.version = version;
                Some(entry)
            }
            None => {
                log::debug!("[gamelist] added server {}", address);
                self.entries.push(GameListEntry::new(address, version));
                self.entries.last_mut()
            }
        }
    }

    /// Add an entry the user typed in; it is never pruned
    pub fn add_manual(&mut self, address: ServerAddress) -> Option<&mut GameListEntry> {
        let entry = self.add_item(address)?;
        entry.manually = true;
        Some(entry)
    }

    /// Store a freshly received record and recompute compatibility
    pub fn update_from_listing(&mut self, info: GameInfo, our_revision: &str) -> bool {
        let address = ServerAddress::JoinKey(info.join_key.clone());
        let Some(entry) = self.add_item(address) else {
            return false;
        };

        entry.version_compatible = is_compatible_version(our_revision, &info.server_revision);
        entry.compatible = entry.version_compatible;
        entry.online = true;
        entry.info = info;
        true
    }

    pub fn remove(&mut self, address: &ServerAddress) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| &e.address != address);
        let removed = self.entries.len() != before;
        if removed {
            log::debug!("[gamelist] removed server {}", address);
        }
        removed
    }

    /// Drop entries the current pass did not touch; returns how many went
    pub fn remove_expired(&mut self) -> usize {
        let version = self.version;
        let before = self.entries.len();
        self.entries.retain(|e| e.manually || e.version >= version);
        before - self.entries.len()
    }

    pub fn get(&self, address: &ServerAddress) -> Option<&GameListEntry> {
        self.entries.iter().find(|e| &e.address == address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameListEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
