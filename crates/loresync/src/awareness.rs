use lib0::decoding::{Cursor, Read};
use lib0::encoding::Write;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::SyncResult;
use crate::protocol::decode_error;

/// Presence metadata announced once per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
}

impl UserInfo {
    /// User info with a color derived from the display name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let color = color_for_name(&name);
        Self { name, color }
    }
}

/// Selection inside the document content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub anchor: u32,
    pub head: u32,
}

/// JSON state carried for one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PeerState {
    user: UserInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<CursorPosition>,
}

/// Ephemeral presence record of one connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub display_name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
}

/// Wire form of an awareness change: `(client id, clock, JSON state)` triples,
/// `"null"` marks a removed client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AwarenessUpdate {
    pub entries: Vec<(u64, u32, String)>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Vec::new();
        encoder.write_var(self.entries.len() as u32);
        for (client_id, clock, json) in &self.entries {
            encoder.write_var(*client_id);
            encoder.write_var(*clock);
            encoder.write_string(json);
        }
        encoder
    }

    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let mut decoder = Cursor::new(data);
        let count: u32 = decoder.read_var().map_err(decode_error)?;
        // The count is untrusted, entries are pushed as they are read
        let mut entries = Vec::new();
        for _ in 0..count {
            let client_id: u64 = decoder.read_var().map_err(decode_error)?;
            let clock: u32 = decoder.read_var().map_err(decode_error)?;
            let json = decoder.read_string().map_err(decode_error)?.to_string();
            entries.push((client_id, clock, json));
        }
        Ok(Self { entries })
    }

    /// Client ids this update touches
    pub fn client_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|(id, _, _)| *id).collect()
    }

    /// Update announcing that the given clients are gone
    pub fn removal(clients: impl IntoIterator<Item = (u64, u32)>) -> Self {
        Self {
            entries: clients
                .into_iter()
                .map(|(id, clock)| (id, clock, "null".to_string()))
                .collect(),
        }
    }
}

/// Local awareness state plus the entries received from peers.
///
/// Each client only mutates its own entry, peer entries are replaced by the
/// updates peers send.
pub struct Awareness {
    client_id: u64,
    clock: u32,
    local: Option<PeerState>,
    peers: HashMap<u64, (u32, AwarenessEntry)>,
}

impl Awareness {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            clock: 0,
            local: None,
            peers: HashMap::new(),
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn local_user(&self) -> Option<&UserInfo> {
        self.local.as_ref().map(|state| &state.user)
    }

    pub fn set_user(&mut self, user: UserInfo) {
        let cursor = self.local.as_ref().and_then(|state| state.cursor);
        self.local = Some(PeerState { user, cursor });
        self.clock += 1;
    }

    /// Update the local cursor. Returns false when no user has been set.
    pub fn set_cursor(&mut self, cursor: Option<CursorPosition>) -> bool {
        match self.local.as_mut() {
            Some(state) => {
                state.cursor = cursor;
                self.clock += 1;
                true
            }
            None => false,
        }
    }

    /// Remove the local entry, peers learn about it through [`Self::encode_local`]
    pub fn clear_local(&mut self) {
        if self.local.take().is_some() {
            self.clock += 1;
        }
    }

    /// Encoded update describing the local entry
    pub fn encode_local(&self) -> Vec<u8> {
        let json = self
            .local
            .as_ref()
            .and_then(|state| serde_json::to_string(state).ok())
            .unwrap_or_else(|| "null".to_string());
        AwarenessUpdate {
            entries: vec![(self.client_id, self.clock, json)],
        }
        .encode()
    }

    /// Apply an update received from a peer, returns the ids that changed
    pub fn apply_update(&mut self, data: &[u8]) -> SyncResult<Vec<u64>> {
        let update = AwarenessUpdate::decode(data)?;
        let mut changed = Vec::new();

        for (client_id, clock, json) in update.entries {
            if client_id == self.client_id {
                continue;
            }
            let known_clock = self.peers.get(&client_id).map(|(clock, _)| *clock);
            if known_clock.is_some_and(|known| clock < known) {
                continue;
            }

            match serde_json::from_str::<Option<PeerState>>(&json) {
                Ok(Some(state)) => {
                    let entry = AwarenessEntry {
                        client_id,
                        display_name: state.user.name,
                        color: state.user.color,
                        cursor: state.cursor,
                    };
                    self.peers.insert(client_id, (clock, entry));
                    changed.push(client_id);
                }
                Ok(None) => {
                    if self.peers.remove(&client_id).is_some() {
                        changed.push(client_id);
                    }
                }
                Err(e) => debug!("Ignoring awareness state of client {}: {}", client_id, e),
            }
        }
        Ok(changed)
    }

    /// Drop every peer entry, used when the channel is lost
    pub fn clear_peers(&mut self) {
        self.peers.clear();
    }

    pub fn peers(&self) -> Vec<AwarenessEntry> {
        let mut peers: Vec<_> = self.peers.values().map(|(_, e)| e.clone()).collect();
        peers.sort_by_key(|entry| entry.client_id);
        peers
    }
}

/// Deterministic `#rrggbb` color for a display name.
///
/// The name is hashed to a hue, rendered at 70% saturation and 50% lightness.
pub fn color_for_name(name: &str) -> String {
    let mut hash: i32 = 0;
    for unit in name.encode_utf16() {
        hash = (unit as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash));
    }
    let hue = (hash.unsigned_abs() % 360) as f64;
    hsl_to_hex(hue, 0.7, 0.5)
}

fn hsl_to_hex(hue: f64, saturation: f64, lightness: f64) -> String {
    let a = saturation * lightness.min(1.0 - lightness);
    let channel = |n: f64| {
        let k = (n + hue / 30.0) % 12.0;
        let value = lightness - a * (k - 3.0).min(9.0 - k).min(1.0).max(-1.0);
        (value * 255.0).round() as u8
    };
    format!("#{:02x}{:02x}{:02x}", channel(0.0), channel(8.0), channel(4.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;

    #[test]
    fn test_oversized_entry_count_is_a_decode_error() {
        let result = AwarenessUpdate::decode(&[0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert!(matches!(result, Err(SyncError::Decode(_))));
    }

    #[test]
    fn test_color_is_deterministic_hex() {
        let color = color_for_name("Ada Lovelace");
        assert_eq!(color, color_for_name("Ada Lovelace"));
        assert_eq!(color.len(), 7);
        assert!(color.starts_with('#'));
        assert!(color[1..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_color_for_zero_hash_is_red_hue() {
        assert_eq!(color_for_name(""), "#d92626");
    }

    #[test]
    fn test_peer_entries_follow_updates() {
        let mut alice = Awareness::new(1);
        alice.set_user(UserInfo::new("Alice"));
        alice.set_cursor(Some(CursorPosition { anchor: 3, head: 5 }));

        let mut bob = Awareness::new(2);
        assert_eq!(bob.apply_update(&alice.encode_local()).unwrap(), vec![1]);

        let peers = bob.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].display_name, "Alice");
        assert_eq!(peers[0].color, color_for_name("Alice"));
        assert_eq!(peers[0].cursor, Some(CursorPosition { anchor: 3, head: 5 }));

        alice.clear_local();
        assert_eq!(bob.apply_update(&alice.encode_local()).unwrap(), vec![1]);
        assert!(bob.peers().is_empty());
    }

    #[test]
    fn test_own_entry_and_stale_clock_ignored() {
        let mut alice = Awareness::new(1);
        alice.set_user(UserInfo::new("Alice"));
        let stale = alice.encode_local();
        alice.set_user(UserInfo::new("Alice Renamed"));

        let mut bob = Awareness::new(2);
        bob.apply_update(&alice.encode_local()).unwrap();
        assert!(bob.apply_update(&stale).unwrap().is_empty());
        assert_eq!(bob.peers()[0].display_name, "Alice Renamed");

        // Echo of our own entry never becomes a peer
        let mut echo = Awareness::new(1);
        echo.apply_update(&alice.encode_local()).unwrap();
        assert!(echo.peers().is_empty());
    }

    #[test]
    fn test_clear_peers_on_channel_loss() {
        let mut alice = Awareness::new(1);
        alice.set_user(UserInfo::new("Alice"));
        let mut bob = Awareness::new(2);
        bob.apply_update(&alice.encode_local()).unwrap();

        bob.clear_peers();
        assert!(bob.peers().is_empty());
    }

    #[test]
    fn test_cursor_requires_user() {
        let mut awareness = Awareness::new(7);
        assert!(!awareness.set_cursor(Some(CursorPosition { anchor: 0, head: 0 })));
    }
}
