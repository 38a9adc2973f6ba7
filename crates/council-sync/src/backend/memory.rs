use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use council_bus::LocalBus;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{BackendError, BackendResult, CouncilBackend};
use crate::channel::ChannelPurpose;
use crate::lifecycle::Transition;
use crate::model::{
    Amendment, EntityId, EntityKey, EntityKind, EntityStatus, SessionId, Tally, Topic, VoteType,
};

/// One request as the backend saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CastVote(EntityKey, VoteType),
    Transition(EntityKey, Transition),
    ListTopics(SessionId),
    ListAmendments(EntityId),
}

/// In-memory portal for tests and offline wiring.
///
/// Holds a single caller's votes. When attached to a [`LocalBus`] it
/// broadcasts a fresh snapshot after every accepted vote or transition,
/// the way the real server does.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
    bus: Option<LocalBus>,
}

#[derive(Default)]
struct State {
    topics: BTreeMap<EntityId, (SessionId, Topic)>,
    amendments: BTreeMap<EntityId, Amendment>,
    votes: HashMap<EntityKey, VoteType>,
    calls: Vec<BackendCall>,
    conflict_next: Option<String>,
}

impl InMemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_bus(bus: LocalBus) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::default(),
            bus: Some(bus),
        })
    }

    pub fn add_topic(&self, session: SessionId, topic: Topic) {
        self.state.lock().topics.insert(topic.id, (session, topic));
    }

    pub fn add_amendment(&self, amendment: Amendment) {
        self.state.lock().amendments.insert(amendment.id, amendment);
    }

    pub fn remove_amendment(&self, id: EntityId) -> Option<Amendment> {
        let mut state = self.state.lock();
        state.votes.remove(&EntityKey::amendment(id));
        state.amendments.remove(&id)
    }

    pub fn topic(&self, id: EntityId) -> Option<Topic> {
        self.state.lock().topics.get(&id).map(|(_, topic)| topic.clone())
    }

    pub fn amendment(&self, id: EntityId) -> Option<Amendment> {
        self.state.lock().amendments.get(&id).cloned()
    }

    /// Makes the next vote or transition fail with a conflict.
    pub fn conflict_next(&self, body: impl Into<String>) {
        self.state.lock().conflict_next = Some(body.into());
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn vote_calls(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, BackendCall::CastVote(..)))
            .count()
    }

    /// Re-broadcasts the stored snapshot of `key`, as if another client
    /// had asked the server for it.
    pub fn broadcast(&self, key: EntityKey) -> bool {
        let snapshot = {
            let state = self.state.lock();
            state.snapshot(key)
        };
        match (snapshot, &self.bus) {
            (Some((destination, body)), Some(bus)) => {
                bus.broadcast(&destination, body);
                true
            }
            _ => false,
        }
    }
}

impl State {
    fn entity_mut(&mut self, key: EntityKey) -> Option<(&mut EntityStatus, &mut Tally)> {
        match key.kind {
            EntityKind::Topic => self
                .topics
                .get_mut(&key.id)
                .map(|(_, topic)| (&mut topic.status, &mut topic.tally)),
            EntityKind::Amendment => self
                .amendments
                .get_mut(&key.id)
                .map(|amendment| (&mut amendment.status, &mut amendment.tally)),
        }
    }

    fn snapshot(&self, key: EntityKey) -> Option<(String, Bytes)> {
        let (destination, status, tally) = match key.kind {
            EntityKind::Topic => {
                let (session, topic) = self.topics.get(&key.id)?;
                (
                    ChannelPurpose::Vote.spec().resolve(*session).inbound,
                    topic.status,
                    topic.tally,
                )
            }
            EntityKind::Amendment => {
                let amendment = self.amendments.get(&key.id)?;
                (
                    ChannelPurpose::AmendmentVote.spec().resolve(key.id).inbound,
                    amendment.status,
                    amendment.tally,
                )
            }
        };
        Some((destination, snapshot_body(key, status, tally)))
    }

    fn take_conflict(&mut self) -> BackendResult<()> {
        match self.conflict_next.take() {
            Some(body) => Err(BackendError::Conflict { body }),
            None => Ok(()),
        }
    }
}

fn snapshot_body(key: EntityKey, status: EntityStatus, tally: Tally) -> Bytes {
    let mut body = match serde_json::to_value(tally) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let id_field = match key.kind {
        EntityKind::Topic => "topicId",
        EntityKind::Amendment => "amendmentId",
    };
    body.insert(id_field.to_string(), Value::from(key.id));
    body.insert("status".to_string(), Value::from(status.as_str()));
    Bytes::from(Value::Object(body).to_string())
}

fn bucket(tally: &mut Tally, vote: VoteType) -> Option<&mut u32> {
    match vote {
        VoteType::Yes => Some(&mut tally.yes),
        VoteType::No => Some(&mut tally.no),
        VoteType::Abstained => Some(&mut tally.abstained),
        VoteType::CannotVote => Some(&mut tally.cant_vote),
        VoteType::HaveNotVoted => None,
    }
}

#[async_trait]
impl CouncilBackend for InMemoryBackend {
    async fn cast_vote(&self, key: EntityKey, vote: VoteType) -> BackendResult<()> {
        {
            let mut state = self.state.lock();
            state.calls.push(BackendCall::CastVote(key, vote));
            state.take_conflict()?;
            let previous = state.votes.get(&key).copied();
            let (status, tally) = state.entity_mut(key).ok_or(BackendError::NotFound(key))?;
            if !status.accepts_votes() {
                return Err(BackendError::Conflict {
                    body: format!("{key} is {status}, not accepting votes"),
                });
            }
            if previous == Some(vote) {
                return Err(BackendError::Conflict {
                    body: format!("vote {vote} already recorded for {key}"),
                });
            }
            if let Some(count) = previous.and_then(|prev| bucket(tally, prev)) {
                *count = count.saturating_sub(1);
            }
            if let Some(count) = bucket(tally, vote) {
                *count += 1;
            }
            state.votes.insert(key, vote);
        }
        self.broadcast(key);
        Ok(())
    }

    async fn transition(&self, key: EntityKey, transition: Transition) -> BackendResult<()> {
        {
            let mut state = self.state.lock();
            state.calls.push(BackendCall::Transition(key, transition));
            state.take_conflict()?;
            let (status, tally) = state.entity_mut(key).ok_or(BackendError::NotFound(key))?;
            let next = status.apply(transition).map_err(|err| BackendError::Conflict {
                body: err.to_string(),
            })?;
            *status = next;
            if transition == Transition::Restart {
                *tally = Tally::default();
                state.votes.remove(&key);
            }
        }
        self.broadcast(key);
        Ok(())
    }

    async fn list_topics(&self, session: SessionId) -> BackendResult<Vec<Topic>> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::ListTopics(session));
        let mut topics: Vec<Topic> = state
            .topics
            .values()
            .filter(|(owner, _)| *owner == session)
            .map(|(_, topic)| topic.clone())
            .collect();
        topics.sort_by_key(|topic| topic.order_id);
        Ok(topics)
    }

    async fn list_amendments(&self, topic: EntityId) -> BackendResult<Vec<Amendment>> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::ListAmendments(topic));
        if !state.topics.contains_key(&topic) {
            return Err(BackendError::NotFound(EntityKey::topic(topic)));
        }
        let mut amendments: Vec<Amendment> = state
            .amendments
            .values()
            .filter(|amendment| amendment.topic_id == topic)
            .cloned()
            .collect();
        amendments.sort_by_key(|amendment| amendment.order_id);
        Ok(amendments)
    }
}
