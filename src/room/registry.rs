use std::collections::HashMap;

use crate::connection::{PeerConnection, PeerSummary};
use crate::error::{Error, Result};
use crate::signaling::ParticipantId;

/// Authoritative participant -> connection map. Owned and mutated only by
/// the orchestrator loop.
pub(crate) struct ConnectionRegistry {
    peers: HashMap<ParticipantId, PeerConnection>,
    max_peers: Option<usize>,
}

impl ConnectionRegistry {
    pub(crate) fn new(max_peers: Option<usize>) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    /// Fails if the id already has an entry or the room is at capacity.
    pub(crate) fn ensure_vacant(&self, id: &ParticipantId) -> Result<()> {
        if self.peers.contains_key(id) {
            return Err(Error::anomaly(format!("{} already has a connection", id)));
        }
        if let Some(max) = self.max_peers {
            if self.peers.len() >= max {
                return Err(Error::RoomFull(max));
            }
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, peer: PeerConnection) -> Result<&mut PeerConnection> {
        self.ensure_vacant(peer.id())?;
        let id = peer.id().clone();
        Ok(self.peers.entry(id).or_insert(peer))
    }

    pub(crate) fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut PeerConnection> {
        self.peers.get_mut(id)
    }

    /// Entry for `id` only if it still belongs to `generation`.
    pub(crate) fn current(&mut self, id: &ParticipantId, generation: u64) -> Option<&mut PeerConnection> {
        self.peers
            .get_mut(id)
            .filter(|peer| peer.generation() == generation)
    }

    pub(crate) fn contains(&self, id: &ParticipantId) -> bool {
        self.peers.contains_key(id)
    }

    /// Remove and close the entry.
    pub(crate) fn remove(&mut self, id: &ParticipantId) -> Option<PeerConnection> {
        let mut peer = self.peers.remove(id)?;
        peer.close();
        Some(peer)
    }

    /// Remove and close every entry.
    pub(crate) fn drain(&mut self) -> Vec<PeerConnection> {
        self.peers
            .drain()
            .map(|(_, mut peer)| {
                peer.close();
                peer
            })
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.peers.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Sorted by participant id.
    pub(crate) fn summaries(&self) -> Vec<PeerSummary> {
        let mut summaries: Vec<PeerSummary> = self.peers.values().map(PeerConnection::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}
