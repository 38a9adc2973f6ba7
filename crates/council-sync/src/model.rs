use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type SessionId = u64;
pub type EntityId = u64;

/// Voting status of a topic or amendment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityStatus {
    Created,
    Active,
    Finished,
    Information,
    Withdrawn,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Created => "CREATED",
            EntityStatus::Active => "ACTIVE",
            EntityStatus::Finished => "FINISHED",
            EntityStatus::Information => "INFORMATION",
            EntityStatus::Withdrawn => "WITHDRAWN",
        }
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteType {
    Yes,
    No,
    Abstained,
    CannotVote,
    HaveNotVoted,
}

impl VoteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Yes => "YES",
            VoteType::No => "NO",
            VoteType::Abstained => "ABSTAINED",
            VoteType::CannotVote => "CANNOT_VOTE",
            VoteType::HaveNotVoted => "HAVE_NOT_VOTED",
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown vote type {0:?}")]
pub struct ParseVoteError(pub String);

impl FromStr for VoteType {
    type Err = ParseVoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        Ok(match normalized.as_str() {
            "YES" => VoteType::Yes,
            "NO" => VoteType::No,
            "ABSTAINED" | "ABSTAIN" => VoteType::Abstained,
            "CANNOT_VOTE" | "CANT_VOTE" => VoteType::CannotVote,
            "HAVE_NOT_VOTED" => VoteType::HaveNotVoted,
            _ => return Err(ParseVoteError(s.to_string())),
        })
    }
}

/// Vote counts for one entity. Always a full snapshot, never a delta.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tally {
    pub yes: u32,
    pub no: u32,
    pub abstained: u32,
    pub cant_vote: u32,
    pub have_not_voted: u32,
    pub absent: u32,
}

impl Tally {
    pub fn as_tuple(&self) -> (u32, u32, u32, u32, u32, u32) {
        (
            self.yes,
            self.no,
            self.abstained,
            self.cant_vote,
            self.have_not_voted,
            self.absent,
        )
    }
}

/// Broadcast body on the vote and amendment-vote channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallySnapshot {
    #[serde(rename = "topicId", alias = "amendmentId")]
    pub entity_id: EntityId,
    #[serde(flatten)]
    pub tally: Tally,
    pub status: EntityStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Topic,
    Amendment,
}

impl EntityKind {
    /// REST collection path segment.
    pub fn path(&self) -> &'static str {
        match self {
            EntityKind::Topic => "topics",
            EntityKind::Amendment => "amendments",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn topic(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Topic,
            id,
        }
    }

    pub fn amendment(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Amendment,
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EntityKind::Topic => write!(f, "topic/{}", self.id),
            EntityKind::Amendment => write!(f, "amendment/{}", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: EntityId,
    pub order_id: i64,
    pub title: String,
    pub status: EntityStatus,
    #[serde(flatten)]
    pub tally: Tally,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_file_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Amendment {
    pub id: EntityId,
    pub topic_id: EntityId,
    pub order_id: i64,
    pub title: String,
    pub status: EntityStatus,
    #[serde(flatten)]
    pub tally: Tally,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_file_url: Option<String>,
}

/// Anything the vote board can be seeded from.
pub trait Votable {
    fn key(&self) -> EntityKey;
    fn status(&self) -> EntityStatus;
    fn tally(&self) -> Tally;
}

impl Votable for Topic {
    fn key(&self) -> EntityKey {
        EntityKey::topic(self.id)
    }

    fn status(&self) -> EntityStatus {
        self.status
    }

    fn tally(&self) -> Tally {
        self.tally
    }
}

impl Votable for Amendment {
    fn key(&self) -> EntityKey {
        EntityKey::amendment(self.id)
    }

    fn status(&self) -> EntityStatus {
        self.status
    }

    fn tally(&self) -> Tally {
        self.tally
    }
}
