//! Local projection of tallies, statuses and the caller's own votes.
//!
//! Snapshots are authoritative: the latest one for an entity replaces
//! whatever was stored, including anything written optimistically.

use std::collections::HashMap;

use crate::lifecycle::status_effect;
use crate::model::{EntityKey, EntityKind, EntityStatus, Tally, TallySnapshot, Votable, VoteType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EntityState {
    status: EntityStatus,
    tally: Tally,
}

/// Result of merging one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub key: EntityKey,
    pub tally: Tally,
    pub status: EntityStatus,
    pub previous_status: Option<EntityStatus>,
    pub voting_enabled: bool,
    /// Own vote went back to `HAVE_NOT_VOTED` because the entity restarted.
    pub own_vote_reset: bool,
    pub tally_changed: bool,
}

impl Reconciled {
    pub fn status_changed(&self) -> bool {
        self.previous_status != Some(self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDecision {
    /// Go ahead; `previous` is what to restore if the request fails.
    Proceed { previous: VoteType },
    /// Same value as the current vote, nothing to send.
    AlreadyRecorded,
    /// The entity is not accepting votes.
    Closed(EntityStatus),
    /// Nothing is known about the entity yet.
    Unknown,
}

#[derive(Debug, Default)]
pub struct VoteBoard {
    entries: HashMap<EntityKey, EntityState>,
    own_votes: HashMap<EntityKey, VoteType>,
}

impl VoteBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_snapshot(&mut self, kind: EntityKind, snapshot: &TallySnapshot) -> Reconciled {
        let key = EntityKey {
            kind,
            id: snapshot.entity_id,
        };
        self.merge(key, snapshot.status, snapshot.tally)
    }

    /// Seeds from a refetched entity through the same path as a broadcast.
    pub fn seed(&mut self, entity: &impl Votable) -> Reconciled {
        self.merge(entity.key(), entity.status(), entity.tally())
    }

    fn merge(&mut self, key: EntityKey, status: EntityStatus, tally: Tally) -> Reconciled {
        let previous = self
            .entries
            .insert(key, EntityState { status, tally });
        let previous_status = previous.map(|state| state.status);
        let effect = status_effect(previous_status, status);

        let mut own_vote_reset = false;
        if effect.reset_own_vote {
            let prior = self.own_votes.insert(key, VoteType::HaveNotVoted);
            own_vote_reset = prior.is_some_and(|vote| vote != VoteType::HaveNotVoted);
        }

        Reconciled {
            key,
            tally,
            status,
            previous_status,
            voting_enabled: effect.voting_enabled,
            own_vote_reset,
            tally_changed: previous.map_or(true, |state| state.tally != tally),
        }
    }

    /// Gating first, then idempotence.
    pub fn prepare_vote(&self, key: EntityKey, vote: VoteType) -> VoteDecision {
        let Some(state) = self.entries.get(&key) else {
            return VoteDecision::Unknown;
        };
        if !state.status.accepts_votes() {
            return VoteDecision::Closed(state.status);
        }
        let current = self.current_vote(key);
        if current == vote {
            VoteDecision::AlreadyRecorded
        } else {
            VoteDecision::Proceed { previous: current }
        }
    }

    /// Optimistic write; returns the value it replaced.
    pub fn record_vote(&mut self, key: EntityKey, vote: VoteType) -> VoteType {
        self.own_votes
            .insert(key, vote)
            .unwrap_or(VoteType::HaveNotVoted)
    }

    pub fn restore_vote(&mut self, key: EntityKey, previous: VoteType) {
        if previous == VoteType::HaveNotVoted {
            self.own_votes.remove(&key);
        } else {
            self.own_votes.insert(key, previous);
        }
    }

    pub fn current_vote(&self, key: EntityKey) -> VoteType {
        self.own_votes
            .get(&key)
            .copied()
            .unwrap_or(VoteType::HaveNotVoted)
    }

    pub fn tally(&self, key: EntityKey) -> Option<Tally> {
        self.entries.get(&key).map(|state| state.tally)
    }

    pub fn status(&self, key: EntityKey) -> Option<EntityStatus> {
        self.entries.get(&key).map(|state| state.status)
    }

    pub fn voting_enabled(&self, key: EntityKey) -> bool {
        self.status(key).is_some_and(EntityStatus::accepts_votes)
    }

    pub fn remove(&mut self, key: EntityKey) -> bool {
        self.own_votes.remove(&key);
        self.entries.remove(&key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = EntityKey> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.own_votes.clear();
    }
}
