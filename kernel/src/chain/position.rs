// Record Link State
//
// Classifies where a record sits in its partition chain, and which
// transitions between those states a chain operation may perform.

use serde::Serialize;

/// Place of a linked record within its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Position {
    /// Only element: both head and tail.
    Sole,
    Head,
    Middle,
    Tail,
}

/// Lifecycle state of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// Created but not in any chain, or removed from one.
    Unlinked,
    Linked(Position),
}

/// Kind of chain operation applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Include,
    Relocate,
    Remove,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("illegal link transition: {0}")]
    IllegalTransition(String),
}

impl LinkState {
    /// Derive the state from a record's own fields.
    ///
    /// A record with any link is linked even if it still carries the
    /// unlinked marker, so audits see it. A record without links but
    /// without the marker is a tail that lost its predecessor; it stays
    /// linked for the same reason.
    pub fn classify(unlinked: bool, is_first: bool, has_next: bool) -> Self {
        match (is_first, has_next) {
            (true, false) => LinkState::Linked(Position::Sole),
            (true, true) => LinkState::Linked(Position::Head),
            (false, true) => LinkState::Linked(Position::Middle),
            (false, false) if unlinked => LinkState::Unlinked,
            (false, false) => LinkState::Linked(Position::Tail),
        }
    }

    pub fn is_linked(&self) -> bool {
        matches!(self, LinkState::Linked(_))
    }

    pub fn is_head(&self) -> bool {
        matches!(
            self,
            LinkState::Linked(Position::Head | Position::Sole)
        )
    }

    pub fn is_tail(&self) -> bool {
        matches!(
            self,
            LinkState::Linked(Position::Tail | Position::Sole)
        )
    }

    /// Validate a transition from `self` to `next`.
    pub fn transition(self, op: Transition, next: LinkState) -> Result<LinkState, StateError> {
        use LinkState::*;
        use Transition::*;

        match (self, op, next) {
            (Unlinked, Include | Relocate, Linked(_)) => Ok(next),
            (Linked(_), Relocate, Linked(_)) => Ok(next),
            (Linked(_), Remove, Unlinked) => Ok(next),
            (Unlinked, Remove, Unlinked) => Ok(next),
            (state, op, next) => Err(StateError::IllegalTransition(format!(
                "cannot go from {:?} to {:?} via {:?}",
                state, next, op
            ))),
        }
    }
}
