//! Voting lifecycle of a topic or amendment.
//!
//! ```text
//! CREATED --start--> ACTIVE --finish--> FINISHED --restart--> CREATED
//! CREATED --information--> INFORMATION
//! CREATED --withdraw--> WITHDRAWN
//! ```
//!
//! Transitions are executed by the backend; the client only validates them
//! up front and reacts to the broadcast that follows.

use std::fmt;

use thiserror::Error;

use crate::model::EntityStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Start,
    Finish,
    Restart,
    MarkInformation,
    Withdraw,
}

impl Transition {
    /// REST action segment, e.g. `PUT /topics/{id}/active`.
    pub fn endpoint(&self) -> &'static str {
        match self {
            Transition::Start => "active",
            Transition::Finish => "finish",
            Transition::Restart => "restart",
            Transition::MarkInformation => "information",
            Transition::Withdraw => "withdraw",
        }
    }

    pub fn target(&self) -> EntityStatus {
        match self {
            Transition::Start => EntityStatus::Active,
            Transition::Finish => EntityStatus::Finished,
            Transition::Restart => EntityStatus::Created,
            Transition::MarkInformation => EntityStatus::Information,
            Transition::Withdraw => EntityStatus::Withdrawn,
        }
    }

    fn allowed_from(&self) -> EntityStatus {
        match self {
            Transition::Start => EntityStatus::Created,
            Transition::Finish => EntityStatus::Active,
            Transition::Restart => EntityStatus::Finished,
            Transition::MarkInformation | Transition::Withdraw => EntityStatus::Created,
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transition::Start => "start",
            Transition::Finish => "finish",
            Transition::Restart => "restart",
            Transition::MarkInformation => "mark as information",
            Transition::Withdraw => "withdraw",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {transition} an entity that is {from}")]
pub struct LifecycleError {
    pub from: EntityStatus,
    pub transition: Transition,
}

impl EntityStatus {
    pub fn accepts_votes(self) -> bool {
        self == EntityStatus::Active
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntityStatus::Information | EntityStatus::Withdrawn)
    }

    pub fn apply(self, transition: Transition) -> Result<EntityStatus, LifecycleError> {
        if transition.allowed_from() == self {
            Ok(transition.target())
        } else {
            Err(LifecycleError {
                from: self,
                transition,
            })
        }
    }
}

/// What a status broadcast means for the local voting controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEffect {
    pub voting_enabled: bool,
    /// The entity went back to CREATED: the caller's own vote no longer counts.
    pub reset_own_vote: bool,
}

pub fn status_effect(previous: Option<EntityStatus>, next: EntityStatus) -> StatusEffect {
    StatusEffect {
        voting_enabled: next.accepts_votes(),
        reset_own_vote: next == EntityStatus::Created
            && previous.is_some_and(|prev| prev != EntityStatus::Created),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_the_voting_cycle() {
        let status = EntityStatus::Created;
        let status = status.apply(Transition::Start).unwrap();
        assert_eq!(status, EntityStatus::Active);
        let status = status.apply(Transition::Finish).unwrap();
        assert_eq!(status, EntityStatus::Finished);
        let status = status.apply(Transition::Restart).unwrap();
        assert_eq!(status, EntityStatus::Created);
    }

    #[test]
    fn terminal_states_only_from_created() {
        assert_eq!(
            EntityStatus::Created.apply(Transition::Withdraw),
            Ok(EntityStatus::Withdrawn)
        );
        assert_eq!(
            EntityStatus::Created.apply(Transition::MarkInformation),
            Ok(EntityStatus::Information)
        );
        let err = EntityStatus::Active.apply(Transition::Withdraw).unwrap_err();
        assert_eq!(err.from, EntityStatus::Active);
        assert_eq!(err.to_string(), "cannot withdraw an entity that is ACTIVE");

        for terminal in [EntityStatus::Information, EntityStatus::Withdrawn] {
            assert!(terminal.is_terminal());
            for transition in [
                Transition::Start,
                Transition::Finish,
                Transition::Restart,
                Transition::MarkInformation,
                Transition::Withdraw,
            ] {
                assert!(terminal.apply(transition).is_err());
            }
        }
    }

    #[test]
    fn only_active_accepts_votes() {
        assert!(EntityStatus::Active.accepts_votes());
        for status in [
            EntityStatus::Created,
            EntityStatus::Finished,
            EntityStatus::Information,
            EntityStatus::Withdrawn,
        ] {
            assert!(!status.accepts_votes());
        }
    }

    #[test]
    fn restart_resets_own_vote() {
        let effect = status_effect(Some(EntityStatus::Finished), EntityStatus::Created);
        assert!(effect.reset_own_vote);
        assert!(!effect.voting_enabled);

        assert!(!status_effect(Some(EntityStatus::Created), EntityStatus::Created).reset_own_vote);
        assert!(!status_effect(None, EntityStatus::Created).reset_own_vote);
        assert!(status_effect(Some(EntityStatus::Created), EntityStatus::Active).voting_enabled);
    }
}
