//! REST side of the portal: votes, lifecycle transitions and the refetch
//! endpoints the notification channels point at.

use async_trait::async_trait;
use thiserror::Error;

use crate::lifecycle::Transition;
use crate::model::{Amendment, EntityId, EntityKey, SessionId, Topic, VoteType};

mod http;
mod memory;

pub use http::HttpBackend;
pub use memory::{BackendCall, InMemoryBackend};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("conflict: {body}")]
    Conflict { body: String },
    #[error("{0} not found")]
    NotFound(EntityKey),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
}

impl BackendError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait CouncilBackend: Send + Sync {
    async fn cast_vote(&self, key: EntityKey, vote: VoteType) -> BackendResult<()>;

    async fn transition(&self, key: EntityKey, transition: Transition) -> BackendResult<()>;

    /// Topics of a session ordered by `order_id`.
    async fn list_topics(&self, session: SessionId) -> BackendResult<Vec<Topic>>;

    /// Amendments of a topic ordered by `order_id`.
    async fn list_amendments(&self, topic: EntityId) -> BackendResult<Vec<Amendment>>;
}
