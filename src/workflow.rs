//! Change-request state machine.
//!
//! REQUESTED -> (approve_edit) -> EDITING -> (student submit) -> REVIEW
//! REVIEW -> (validate) -> APPROVED
//! any non-terminal -> (reject) -> REJECTED

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Requested,
    Editing,
    Review,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Requested => "requested",
            RequestStatus::Editing => "editing",
            RequestStatus::Review => "review",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(RequestStatus::Requested),
            "editing" => Some(RequestStatus::Editing),
            "review" => Some(RequestStatus::Review),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Approved | RequestStatus::Rejected)
    }
}

pub const ACTIVE_STATUSES: &[RequestStatus] = &[
    RequestStatus::Requested,
    RequestStatus::Editing,
    RequestStatus::Review,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    ApproveEdit,
    Validate,
    Reject,
}

impl AdminAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminAction::ApproveEdit => "approve_edit",
            AdminAction::Validate => "validate",
            AdminAction::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve_edit" => Some(AdminAction::ApproveEdit),
            "validate" => Some(AdminAction::Validate),
            "reject" => Some(AdminAction::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: RequestStatus,
    pub action: AdminAction,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action {} is not allowed while the request is {}",
            self.action.as_str(),
            self.from.as_str()
        )
    }
}

/// Resolve an admin action against the current status. Pure: the caller owns
/// all side effects (applying proposed changes, storing notes).
pub fn apply_action(
    from: RequestStatus,
    action: AdminAction,
) -> Result<RequestStatus, InvalidTransition> {
    match (from, action) {
        (RequestStatus::Requested, AdminAction::ApproveEdit) => Ok(RequestStatus::Editing),
        (RequestStatus::Review, AdminAction::Validate) => Ok(RequestStatus::Approved),
        (s, AdminAction::Reject) if !s.is_terminal() => Ok(RequestStatus::Rejected),
        _ => Err(InvalidTransition { from, action }),
    }
}

/// Student submission is only legal from EDITING. A REQUESTED submission is
/// rejected on purpose: edit access has to be granted first.
pub fn submit_allowed(from: RequestStatus) -> bool {
    from == RequestStatus::Editing
}

#[cfg(test)]
mod tests {
    use super::*;
    use AdminAction::*;
    use RequestStatus::*;

    #[test]
    fn approve_edit_only_from_requested() {
        assert_eq!(apply_action(Requested, ApproveEdit), Ok(Editing));
        for s in [Editing, Review, Approved, Rejected] {
            assert!(apply_action(s, ApproveEdit).is_err());
        }
    }

    #[test]
    fn validate_only_from_review() {
        assert_eq!(apply_action(Review, Validate), Ok(Approved));
        for s in [Requested, Editing, Approved, Rejected] {
            assert!(apply_action(s, Validate).is_err());
        }
    }

    #[test]
    fn reject_from_any_non_terminal() {
        for s in [Requested, Editing, Review] {
            assert_eq!(apply_action(s, Reject), Ok(Rejected));
        }
        for s in [Approved, Rejected] {
            assert!(apply_action(s, Reject).is_err());
        }
    }

    #[test]
    fn submit_requires_editing() {
        assert!(submit_allowed(Editing));
        for s in [Requested, Review, Approved, Rejected] {
            assert!(!submit_allowed(s));
        }
    }

    #[test]
    fn status_strings_roundtrip() {
        for s in [Requested, Editing, Review, Approved, Rejected] {
            assert_eq!(RequestStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RequestStatus::parse("REQUESTED"), None);
    }
}
