//! Per-client presence ("awareness") for one document.
//!
//! Presence blobs are ephemeral and never persisted. A client appears in
//! the table only after it has sent awareness and until it is removed;
//! every removal must be followed by a retraction broadcast
//! ([`crate::protocol::awareness_removal_frame`]) or remote cursors go stale.

use std::collections::HashMap;

use crate::protocol::ClientId;

/// Latest presence blob per connected client.
#[derive(Debug, Default, Clone)]
pub struct AwarenessTable {
    states: HashMap<ClientId, Vec<u8>>,
}

impl AwarenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the presence blob for a client.
    pub fn set(&mut self, client_id: ClientId, state: Vec<u8>) {
        self.states.insert(client_id, state);
    }

    /// Remove a client's presence, returning the previous blob if present.
    pub fn remove(&mut self, client_id: ClientId) -> Option<Vec<u8>> {
        self.states.remove(&client_id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&[u8]> {
        self.states.get(&client_id).map(Vec::as_slice)
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.states.contains_key(&client_id)
    }

    /// Every stored entry, ordered by client id.
    pub fn snapshot(&self) -> Vec<(ClientId, Vec<u8>)> {
        let mut entries: Vec<(ClientId, Vec<u8>)> = self
            .states
            .iter()
            .map(|(id, state)| (*id, state.clone()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_replaces_previous_state() {
        let mut table = AwarenessTable::new();
        table.set(1, vec![1]);
        table.set(1, vec![2, 2]);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(1), Some(&[2u8, 2][..]));
    }

    #[test]
    fn test_absent_until_set_and_after_remove() {
        let mut table = AwarenessTable::new();
        assert!(!table.contains(3));
        assert_eq!(table.remove(3), None);

        table.set(3, vec![9]);
        assert!(table.contains(3));
        assert_eq!(table.remove(3), Some(vec![9]));
        assert!(!table.contains(3));
        assert!(table.is_empty());
    }

    #[test]
    fn test_snapshot_sorted_by_client() {
        let mut table = AwarenessTable::new();
        table.set(5, vec![5]);
        table.set(2, vec![2]);
        table.set(9, vec![9]);

        let snapshot = table.snapshot();
        let ids: Vec<ClientId> = snapshot.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(snapshot[1].1, vec![5]);
    }
}
