//! Typed view of inbound channel bodies.

use bytes::Bytes;
use thiserror::Error;

use crate::channel::ChannelPurpose;
use crate::model::{EntityId, TallySnapshot};

pub const NEW_TOPIC: &str = "NEW_TOPIC";
pub const NEW_AMENDMENT: &str = "NEW_AMENDMENT";
const DELETE_AMENDMENT_PREFIX: &str = "DELETE_AMENDMENT_";

/// Payload-free "something changed, go refetch" signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    NewTopic,
    NewAmendment,
    DeleteAmendment(EntityId),
    Other(String),
}

impl Notice {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw {
            NEW_TOPIC => Notice::NewTopic,
            NEW_AMENDMENT => Notice::NewAmendment,
            _ => match raw
                .strip_prefix(DELETE_AMENDMENT_PREFIX)
                .and_then(|id| id.parse().ok())
            {
                Some(id) => Notice::DeleteAmendment(id),
                None => Notice::Other(raw.to_string()),
            },
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Notice::NewTopic => NEW_TOPIC.to_string(),
            Notice::NewAmendment => NEW_AMENDMENT.to_string(),
            Notice::DeleteAmendment(id) => format!("{DELETE_AMENDMENT_PREFIX}{id}"),
            Notice::Other(raw) => raw.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Tally(TallySnapshot),
    /// `None` when the presenter cleared the focus.
    Presented(Option<EntityId>),
    Notice(Notice),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body is not utf-8")]
    Utf8,
    #[error("invalid tally snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("invalid entity id {0:?}")]
    EntityId(String),
}

pub fn decode(purpose: ChannelPurpose, body: &Bytes) -> Result<ChannelMessage, DecodeError> {
    match purpose {
        ChannelPurpose::Vote | ChannelPurpose::AmendmentVote => {
            Ok(ChannelMessage::Tally(serde_json::from_slice(body)?))
        }
        ChannelPurpose::Presenter => {
            let text = std::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
            // Brokers occasionally wrap plain bodies in JSON quotes.
            let text = text.trim().trim_matches('"');
            if text.is_empty() || text == "null" {
                return Ok(ChannelMessage::Presented(None));
            }
            text.parse()
                .map(|id| ChannelMessage::Presented(Some(id)))
                .map_err(|_| DecodeError::EntityId(text.to_string()))
        }
        ChannelPurpose::NewTopic | ChannelPurpose::NewAmendment => {
            let text = std::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
            Ok(ChannelMessage::Notice(Notice::parse(text.trim_matches('"'))))
        }
    }
}
