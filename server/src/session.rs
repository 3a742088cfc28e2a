//! The hosted session and its player registry.
//!
//! A single long-lived [`Session`] owns every [`Player`]. Players are created
//! through the session (which allocates their identifiers), mutated through
//! lookups on it, and removed by it — deleting a system player cascades to
//! every player that points at it. The session also owns the session-wide
//! attributes: the instance and application GUIDs, the human-readable name,
//! the flags advertised during enumeration, the id-obfuscation mask and the
//! steady-clock origin the 32-bit tick count is derived from.

use log::info;
use std::collections::HashMap;
use std::time::Instant;

use shared::PLAYER_SYSTEM;

/// One player in the hosted session.
///
/// A system player represents a client machine; its `system_player_id` is
/// its own id. Non-system players represent game participants and point at
/// the system player of the machine that owns them.
#[derive(Debug)]
pub struct Player {
    pub id: u32,
    pub flags: u32,
    pub system_player_id: u32,
    pub short_name: String,
    pub long_name: String,
    /// Opaque reach-me bytes; in practice two 16-byte socket-address blobs.
    pub service_provider_data: Vec<u8>,
    pub player_data: Vec<u8>,
}

impl Player {
    fn new(id: u32, system_player_id: u32, flags: u32) -> Self {
        Self {
            id,
            flags,
            system_player_id,
            short_name: String::new(),
            long_name: String::new(),
            service_provider_data: Vec::new(),
            player_data: Vec::new(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.flags & PLAYER_SYSTEM != 0
    }
}

/// The authoritative registry for the single hosted session.
pub struct Session {
    instance_guid: [u8; 16],
    application_guid: [u8; 16],
    name: String,
    flags: u32,
    max_players: u32,
    /// XORed with every player id that crosses the wire, and echoed in the
    /// session description so clients use the same mask.
    id_mask: u32,
    /// Upper 16 bits of newly minted ids; advances once per allocation.
    id_uniqueness: u32,
    started: Instant,
    players: HashMap<u32, Player>,
}

impl Session {
    pub fn new(
        name: String,
        application_guid: [u8; 16],
        flags: u32,
        max_players: u32,
        id_mask: u32,
    ) -> Self {
        Self {
            // A fixed pattern; generating a real GUID is out of scope, the
            // value only has to stay stable for the session lifetime.
            instance_guid: [1; 16],
            application_guid,
            name,
            flags,
            max_players,
            id_mask,
            id_uniqueness: 1,
            started: Instant::now(),
            players: HashMap::new(),
        }
    }

    pub fn instance_guid(&self) -> &[u8; 16] {
        &self.instance_guid
    }

    pub fn application_guid(&self) -> &[u8; 16] {
        &self.application_guid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn max_players(&self) -> u32 {
        self.max_players
    }

    pub fn id_mask(&self) -> u32 {
        self.id_mask
    }

    /// Applies the id-obfuscation XOR; its own inverse.
    pub fn adjust_id(&self, id: u32) -> u32 {
        id ^ self.id_mask
    }

    /// Milliseconds since the session started, truncated to 32 bits.
    pub fn tick_count(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    /// Number of non-system players currently in the session.
    pub fn player_count(&self) -> u32 {
        self.players.values().filter(|p| !p.is_system()).count() as u32
    }

    /// Total number of player records, system players included.
    pub fn num_players(&self) -> usize {
        self.players.len()
    }

    /// Creates a system player; its system-player id is its own id.
    pub fn create_system_player(&mut self, flags: u32) -> u32 {
        let id = self.alloc_player_id();
        self.players.insert(id, Player::new(id, id, flags | PLAYER_SYSTEM));
        info!("created system player {:#010x}", id);
        id
    }

    /// Creates a non-system player owned by the given system player.
    ///
    /// Fails once the non-system player count has reached the session
    /// maximum.
    pub fn create_player(&mut self, system_player_id: u32, flags: u32) -> Option<u32> {
        if self.player_count() >= self.max_players {
            return None;
        }

        let id = self.alloc_player_id();
        self.players
            .insert(id, Player::new(id, system_player_id, flags & !PLAYER_SYSTEM));
        info!("created player {:#010x} (system player {:#010x})", id, system_player_id);
        Some(id)
    }

    pub fn player(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_mut(&mut self, id: u32) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    /// Removes a player. Removing a system player also removes every player
    /// whose system-player id points at it — itself included, since a system
    /// player's system player is itself.
    pub fn delete_player(&mut self, id: u32) {
        let Some(player) = self.players.get(&id) else {
            return;
        };

        if player.is_system() {
            let before = self.players.len();
            self.players.retain(|_, p| p.system_player_id != id);
            info!(
                "deleted system player {:#010x} and {} subordinate(s)",
                id,
                before - self.players.len() - 1
            );
        } else {
            self.players.remove(&id);
            info!("deleted player {:#010x}", id);
        }
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    fn alloc_player_id(&mut self) -> u32 {
        // Low half is the next unused slot index, high half the uniqueness
        // counter; the composed value is probed forward until unused.
        let mut id = (self.players.len() as u32 & 0xFFFF) | self.id_uniqueness << 16;
        while self.players.contains_key(&id) {
            id = id.wrapping_add(1);
        }

        self.id_uniqueness = self.id_uniqueness.wrapping_add(1) & 0xFFFF;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{PLAYER_NAME_SERVER, PLAYER_SENDING_MACHINE};
    use std::collections::HashSet;

    fn test_session(mask: u32) -> Session {
        Session::new("TestRoom".to_string(), [0xAB; 16], 0, 10, mask)
    }

    #[test]
    fn system_player_points_at_itself() {
        let mut session = test_session(0);
        let id = session.create_system_player(PLAYER_NAME_SERVER | PLAYER_SENDING_MACHINE);

        let player = session.player(id).unwrap();
        assert!(player.is_system());
        assert_eq!(player.system_player_id, id);
        assert_eq!(session.player_count(), 0);
        assert_eq!(session.num_players(), 1);
    }

    #[test]
    fn non_system_player_counts_toward_limit() {
        let mut session = test_session(0);
        let system_id = session.create_system_player(0);
        let id = session.create_player(system_id, 0).unwrap();

        let player = session.player(id).unwrap();
        assert!(!player.is_system());
        assert_eq!(player.system_player_id, system_id);
        assert_eq!(session.player_count(), 1);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut session = Session::new("tiny".to_string(), [0; 16], 0, 2, 0);
        let system_id = session.create_system_player(0);

        assert!(session.create_player(system_id, 0).is_some());
        assert!(session.create_player(system_id, 0).is_some());
        assert!(session.create_player(system_id, 0).is_none());
        assert_eq!(session.player_count(), 2);

        // System players are not limited.
        session.create_system_player(0);
    }

    #[test]
    fn ids_stay_unique_across_creates_and_deletes() {
        let mut session = Session::new("TestRoom".to_string(), [0xAB; 16], 0, 100, 0);
        let mut live = HashSet::new();

        let system_id = session.create_system_player(0);
        assert!(live.insert(system_id));

        for round in 0..5 {
            let mut created = Vec::new();
            for _ in 0..8 {
                let id = session.create_player(system_id, 0).unwrap();
                assert!(live.insert(id), "duplicate id {:#010x} in round {}", id, round);
                created.push(id);
            }
            for id in created.iter().take(6) {
                session.delete_player(*id);
                live.remove(id);
            }
        }

        // Every survivor still resolves and ids are still distinct.
        let ids: HashSet<u32> = session.players().map(|p| p.id).collect();
        assert_eq!(ids.len(), session.num_players());
    }

    #[test]
    fn uniqueness_counter_varies_high_bits() {
        let mut session = test_session(0);
        let a = session.create_system_player(0);
        let b = session.create_system_player(0);
        assert_ne!(a >> 16, b >> 16);
    }

    #[test]
    fn deleting_system_player_cascades() {
        let mut session = test_session(0);
        let system_a = session.create_system_player(0);
        let system_b = session.create_system_player(0);
        let player_a1 = session.create_player(system_a, 0).unwrap();
        let player_a2 = session.create_player(system_a, 0).unwrap();
        let player_b1 = session.create_player(system_b, 0).unwrap();

        session.delete_player(system_a);

        assert!(session.player(system_a).is_none());
        assert!(session.player(player_a1).is_none());
        assert!(session.player(player_a2).is_none());
        assert!(session.player(system_b).is_some());
        assert!(session.player(player_b1).is_some());
        assert_eq!(session.player_count(), 1);
    }

    #[test]
    fn deleting_non_system_player_removes_only_it() {
        let mut session = test_session(0);
        let system_id = session.create_system_player(0);
        let player_id = session.create_player(system_id, 0).unwrap();

        session.delete_player(player_id);

        assert!(session.player(player_id).is_none());
        assert!(session.player(system_id).is_some());
    }

    #[test]
    fn deleting_unknown_player_is_a_no_op() {
        let mut session = test_session(0);
        session.create_system_player(0);
        session.delete_player(0xFFFF_FFFF);
        assert_eq!(session.num_players(), 1);
    }

    #[test]
    fn adjust_id_is_an_involution() {
        let session = test_session(0x5A5A_1234);
        for id in [0u32, 1, 0xFFFF_FFFF, 0x0001_0003, 0x5A5A_1234] {
            assert_eq!(session.adjust_id(session.adjust_id(id)), id);
        }

        // A zero mask leaves ids untouched.
        let plain = test_session(0);
        assert_eq!(plain.adjust_id(0x1234_5678), 0x1234_5678);
    }

    #[test]
    fn tick_count_starts_near_zero() {
        let session = test_session(0);
        assert!(session.tick_count() < 1_000);
    }
}
