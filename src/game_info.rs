/**
 * game_info.rs
 *
 * Public description of a hosted game and its wire encoding
 *
 * Game info protocol v5:
 *   u8          game info version
 *   string      join-key
 *   u8          number of content files (n)
 *   n times:    u32 content id, bytes[16] MD5 checksum
 *   u32         current game date (days since year 0)
 *   u32         start date (days since year 0)
 *   u8 x 6      companies max/on, clients max/on, spectators max/on
 *   string      server name
 *   string      server revision
 *   bool        password protected
 *   bool        dedicated
 *   u16 x 2     map width, map height
 *   u8          map set (landscape)
 */

use crate::network::{Packet, PacketError};
use serde::{Deserialize, Serialize};

pub const GAME_INFO_VERSION: u8 = 5;

/// Byte budgets for strings carried in game info
pub const JOIN_KEY_LENGTH: usize = 64;
pub const NAME_LENGTH: usize = 80;
pub const REVISION_LENGTH: usize = 33;

/// Most content identifiers one game info may carry
pub const MAX_CONTENT_COUNT: usize = 62;

/// Identifies one piece of content (e.g. a NewGRF) the game depends on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentIdentifier {
    pub id: u32,
    #[serde(with = "hex::serde")]
    pub md5sum: [u8; 16],
}

/// Snapshot of a hosted game's public state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub join_key: String,
    pub content: Vec<ContentIdentifier>,
    pub game_date: u32,
    pub start_date: u32,
    pub companies_max: u8,
    pub companies_on: u8,
    pub clients_max: u8,
    pub clients_on: u8,
    pub spectators_max: u8,
    pub spectators_on: u8,
    pub server_name: String,
    pub server_revision: String,
    pub use_password: bool,
    pub dedicated: bool,
    pub map_width: u16,
    pub map_height: u16,
    pub map_set: u8,
}

impl GameInfo {
    /// Append this record to `packet`
    pub fn serialize(&self, packet: &mut Packet) {
        packet.send_u8(GAME_INFO_VERSION);
        packet.send_string(truncate(&self.join_key, JOIN_KEY_LENGTH));

        if self.content.len() > MAX_CONTENT_COUNT {
            log::warn!(
                "[gameinfo] {} content entries, only the first {} are advertised",
                self.content.len(),
                MAX_CONTENT_COUNT
            );
        }
        let content = &self.content[..self.content.len().min(MAX_CONTENT_COUNT)];
        packet.send_u8(content.len() as u8);
        for c in content {
            packet.send_u32(c.id);
            packet.send_bytes(&c.md5sum);
        }

        packet.send_u32(self.game_date);
        packet.send_u32(self.start_date);

        packet.send_u8(self.companies_max);
        packet.send_u8(self.companies_on);
        packet.send_u8(self.clients_max);
        packet.send_u8(self.clients_on);
        packet.send_u8(self.spectators_max);
        packet.send_u8(self.spectators_on);

        packet.send_string(truncate(&self.server_name, NAME_LENGTH));
        packet.send_string(truncate(&self.server_revision, REVISION_LENGTH));
        packet.send_bool(self.use_password);
        packet.send_bool(self.dedicated);

        packet.send_u16(self.map_width);
        packet.send_u16(self.map_height);
        packet.send_u8(self.map_set);
    }

    /// Read one record from `packet`
    pub fn deserialize(packet: &mut Packet) -> Result<Self, PacketError> {
        let version = packet.recv_u8()?;
        if version != GAME_INFO_VERSION {
            return Err(PacketError::UnsupportedGameInfoVersion(version));
        }

        let join_key = packet.recv_string(JOIN_KEY_LENGTH)?;

        let count = packet.recv_u8()? as usize;
        if count > MAX_CONTENT_COUNT {
            return Err(PacketError::InvalidValue("content count"));
        }
        let mut content = Vec::with_capacity(count);
        for _ in 0..count {
            let id = packet.recv_u32()?;
            let md5sum = packet.recv_bytes::<16>()?;
            content.push(ContentIdentifier { id, md5sum });
        }

        Ok(Self {
            join_key,
            content,
            game_date: packet.recv_u32()?,
            start_date: packet.recv_u32()?,
            companies_max: packet.recv_u8()?,
            companies_on: packet.recv_u8()?,
            clients_max: packet.recv_u8()?,
            clients_on: packet.recv_u8()?,
            spectators_max: packet.recv_u8()?,
            spectators_on: packet.recv_u8()?,
            server_name: packet.recv_string(NAME_LENGTH)?,
            server_revision: packet.recv_string(REVISION_LENGTH)?,
            use_password: packet.recv_bool()?,
            dedicated: packet.recv_bool()?,
            map_width: packet.recv_u16()?,
            map_height: packet.recv_u16()?,
            map_set: packet.recv_u8()?,
        })
    }
}

/// Whether a server running `other` can be joined by `ours`
pub fn is_compatible_version(ours: &str, other: &str) -> bool {
    truncate(ours, REVISION_LENGTH) == truncate(other, REVISION_LENGTH)
}

fn truncate(s: &str, max_len: usize) -> &str {
    let mut end = s.len().min(max_len);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GameInfo {
        GameInfo {
            join_key: "ABCD1234".into(),
            content: vec![
                ContentIdentifier { id: 0x4D4C0101, md5sum: [0xAB; 16] },
                ContentIdentifier { id: 7, md5sum: *b"0123456789abcdef" },
            ],
            game_date: 720_000,
            start_date: 711_000,
            companies_max: 15,
            companies_on: 3,
            clients_max: 25,
            clients_on: 4,
            spectators_max: 10,
            spectators_on: 1,
            server_name: "Transport Tycoons United".into(),
            server_revision: "1.11.0".into(),
            use_password: true,
            dedicated: false,
            map_width: 512,
            map_height: 256,
            map_set: 2,
        }
    }

    fn reread(info: &GameInfo) -> GameInfo {
        let mut p = Packet::new(0);
        info.serialize(&mut p);
        let mut p = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        let decoded = GameInfo::deserialize(&mut p).unwrap();
        assert_eq!(p.remaining(), 0);
        decoded
    }

    #[test]
    fn test_game_info_survives_the_wire() {
        let info = sample();
        assert_eq!(reread(&info), info);
    }

    #[test]
    fn test_long_strings_are_cut_to_budget() {
        let mut info = sample();
        info.server_name = "x".repeat(200);
        let decoded = reread(&info);
        assert_eq!(decoded.server_name.len(), NAME_LENGTH);
    }

    #[test]
    fn test_content_list_is_capped() {
        let mut info = sample();
        info.content = (0..100)
            .map(|id| ContentIdentifier { id, md5sum: [0; 16] })
            .collect();
        let decoded = reread(&info);
        assert_eq!(decoded.content.len(), MAX_CONTENT_COUNT);
        assert_eq!(decoded.content[61].id, 61);
    }

    #[test]
    fn test_rejects_other_versions() {
        let mut p = Packet::new(0);
        p.send_u8(GAME_INFO_VERSION + 1);
        let mut p = Packet::from_frame(p.into_frame().unwrap()).unwrap();
        assert_eq!(
            GameInfo::deserialize(&mut p),
            Err(PacketError::UnsupportedGameInfoVersion(GAME_INFO_VERSION + 1))
        );
    }

    #[test]
    fn test_version_compatibility() {
        assert!(is_compatible_version("1.11.0", "1.11.0"));
        assert!(!is_compatible_version("1.11.0", "1.11.1"));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["content"][0]["md5sum"], "abababababababababababababababab");
        assert_eq!(json["join_key"], "ABCD1234");
    }
}
