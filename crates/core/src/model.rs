//! Domain entities for the specimen request lifecycle.
//!
//! Every entity is an immutable value: "update" operations take the current
//! value plus the changed fields and persist a new value through the store.
//! Row identities are integer newtypes matching the relational schema; each
//! request additionally carries a globally unique `entity_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use srt_types::Label;
use uuid::Uuid;

/// Identifies a study container. All registries and requests are scoped to a
/// container; entities never cross containers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StatusId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequirementId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SiteId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub i32);

/// A workflow stage a request can occupy.
///
/// Statuses are ordered by `sort_order`. Exactly one system status exists per
/// container (the shopping cart); it always sorts first, cannot be deleted and
/// its label is fixed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: StatusId,
    pub container: ContainerId,
    pub label: Label,
    pub sort_order: i32,
    /// Terminal success/failure stage; the request becomes immutable.
    pub is_final_state: bool,
    /// At or after this stage the request's vial set may not be changed.
    pub locks_specimens: bool,
    pub is_system_status: bool,
}

/// Whether an actor is scoped to a single site or applies study-wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorScope {
    /// One group for the whole study (e.g. an IRB).
    StudyWide,
    /// One group per site (e.g. a providing lab).
    PerSite,
}

/// A role that can be assigned requirements or notified of request events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub container: ContainerId,
    pub label: Label,
    pub sort_order: i32,
    pub scope: ActorScope,
}

impl Actor {
    pub fn is_per_site(&self) -> bool {
        matches!(self.scope, ActorScope::PerSite)
    }
}

/// The flavour of site a requirement applies to, used when cloning default
/// templates into live requirements for a concrete request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    /// Paired with each site vials in the request originated from.
    OriginatingSite,
    /// Paired with each site currently providing vials in the request.
    ProvidingSite,
    /// Paired with the request's destination site.
    ReceivingSite,
    /// Study-wide; never paired with a site.
    NonSite,
}

/// Whether a requirement is a default template or attached to a live request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementOwner {
    /// A blueprint cloned into every applicable new request.
    Template,
    /// A live requirement attached to exactly one request.
    Request(RequestId),
}

/// A checklist entry that must be marked complete as part of a request's
/// approval workflow.
///
/// Invariant: `site_id` is `Some` iff the referenced actor is per-site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: RequirementId,
    pub container: ContainerId,
    pub owner: RequirementOwner,
    pub kind: RequirementKind,
    pub actor_id: ActorId,
    pub site_id: Option<SiteId>,
    pub description: String,
    pub complete: bool,
}

impl Requirement {
    /// The request this requirement is attached to, if it is live.
    pub fn request_id(&self) -> Option<RequestId> {
        match self.owner {
            RequirementOwner::Template => None,
            RequirementOwner::Request(id) => Some(id),
        }
    }
}

/// An aggregate grouping of vials plus workflow state, requested for shipment
/// to a destination site.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub container: ContainerId,
    pub entity_id: Uuid,
    pub destination_site_id: SiteId,
    pub status_id: StatusId,
    pub comments: Option<String>,
    pub created_by: UserId,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// A location that can hold or receive specimens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub container: ContainerId,
    pub label: Label,
}

/// The caller's capabilities, supplied by the host application as opaque
/// boolean inputs. The core never consults an access-control list itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub admin: bool,
    pub manage_requests: bool,
    pub request_specimens: bool,
}

impl User {
    /// A caller holding every capability, convenient for administrative jobs.
    pub fn admin(id: UserId) -> Self {
        Self {
            id,
            admin: true,
            manage_requests: true,
            request_specimens: true,
        }
    }

    /// A caller who may build and submit their own requests but not manage
    /// others'.
    pub fn requester(id: UserId) -> Self {
        Self {
            id,
            admin: false,
            manage_requests: false,
            request_specimens: true,
        }
    }
}
