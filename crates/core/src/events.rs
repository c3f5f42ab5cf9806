//! Append-only audit log of request activity.
//!
//! Every committed change to a request or requirement records an event with a
//! human-readable summary. The core only ever appends; deletion happens solely
//! when a shopping-cart request is permanently removed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ContainerId, EventId, RequestId, RequirementId, UserId};

/// The kind of change an audit event records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEventType {
    RequestCreated,
    SpecimenAdded,
    SpecimenRemoved,
    RequestStatusChanged,
    RequirementAdded,
    RequirementRemoved,
    CommentAdded,
}

impl RequestEventType {
    /// Display name used when rendering event histories.
    pub fn display_name(&self) -> &'static str {
        match self {
            RequestEventType::RequestCreated => "Request Created",
            RequestEventType::SpecimenAdded => "Specimen(s) Added",
            RequestEventType::SpecimenRemoved => "Specimen(s) Removed",
            RequestEventType::RequestStatusChanged => "Request Status Changed",
            RequestEventType::RequirementAdded => "Requirement Added",
            RequestEventType::RequirementRemoved => "Requirement Removed",
            RequestEventType::CommentAdded => "Comment Added",
        }
    }
}

/// One entry in the request audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub id: EventId,
    pub container: ContainerId,
    pub request_id: RequestId,
    /// Set when the event concerns a single requirement.
    pub requirement_id: Option<RequirementId>,
    pub event_type: RequestEventType,
    pub summary: String,
    pub created_by: UserId,
    pub created: DateTime<Utc>,
}
