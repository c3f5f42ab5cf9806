//! In-memory relational store backing the request core.
//!
//! The store replaces the process-wide singleton managers of older designs
//! with an explicitly constructed handle: services hold an `Arc<StudyStore>`
//! and no ambient global state exists. A single write guard per mutating
//! operation is the transaction boundary; operations validate fully against
//! the guarded state before applying any change, so either the whole effect
//! commits or nothing does. The same guard serialises racing vial additions,
//! which is what upholds the exclusivity invariant under concurrency.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use srt_types::Label;

use crate::events::{RequestEvent, RequestEventType};
use crate::model::{
    Actor, ActorId, ContainerId, EventId, Request, RequestId, Requirement, RequirementId,
    RequirementOwner, Site, SiteId, Status, StatusId, UserId,
};
use crate::rules::RequestableRule;

/// Label of the fixed system status every container carries.
pub const SYSTEM_STATUS_LABEL: &str = "Not Yet Submitted";

/// The system status sorts at -1 so it is always first, while administrator
/// statuses occupy the contiguous range starting at 0.
pub const SYSTEM_STATUS_SORT_ORDER: i32 = -1;

/// One row of the request/vial join table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VialMapping {
    pub container: ContainerId,
    pub request_id: RequestId,
    pub global_unique_id: String,
}

/// All relational state, guarded by the store's lock.
#[derive(Default)]
pub struct StoreState {
    next_id: i32,
    pub(crate) statuses: BTreeMap<StatusId, Status>,
    pub(crate) actors: BTreeMap<ActorId, Actor>,
    pub(crate) requirements: BTreeMap<RequirementId, Requirement>,
    pub(crate) requests: BTreeMap<RequestId, Request>,
    pub(crate) sites: BTreeMap<SiteId, Site>,
    pub(crate) vial_mappings: Vec<VialMapping>,
    pub(crate) rules: BTreeMap<ContainerId, Vec<RequestableRule>>,
    pub(crate) events: Vec<RequestEvent>,
}

impl StoreState {
    pub(crate) fn allocate_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    /// Statuses of a container ordered by sort order, system status first.
    pub(crate) fn statuses_sorted(&self, container: ContainerId) -> Vec<Status> {
        let mut statuses: Vec<Status> = self
            .statuses
            .values()
            .filter(|s| s.container == container)
            .cloned()
            .collect();
        statuses.sort_by_key(|s| (s.sort_order, s.id));
        statuses
    }

    /// Creates the fixed shopping-cart status if the container does not have
    /// one yet, and returns its id.
    pub(crate) fn ensure_system_status(&mut self, container: ContainerId) -> StatusId {
        if let Some(status) = self
            .statuses
            .values()
            .find(|s| s.container == container && s.is_system_status)
        {
            return status.id;
        }

        let id = StatusId(self.allocate_id());
        let label = Label::new(SYSTEM_STATUS_LABEL)
            .unwrap_or_else(|_| unreachable!("system status label is a valid label"));
        self.statuses.insert(
            id,
            Status {
                id,
                container,
                label,
                sort_order: SYSTEM_STATUS_SORT_ORDER,
                is_final_state: false,
                locks_specimens: false,
                is_system_status: true,
            },
        );
        id
    }

    /// The status a request enters when it leaves the shopping cart: the
    /// first non-system status in sort order, if any is configured.
    pub(crate) fn initial_post_submission_status(&self, container: ContainerId) -> Option<Status> {
        self.statuses_sorted(container)
            .into_iter()
            .find(|s| !s.is_system_status)
    }

    pub(crate) fn status(&self, container: ContainerId, id: StatusId) -> Option<&Status> {
        self.statuses
            .get(&id)
            .filter(|s| s.container == container)
    }

    pub(crate) fn request(&self, container: ContainerId, id: RequestId) -> Option<&Request> {
        self.requests
            .get(&id)
            .filter(|r| r.container == container)
    }

    pub(crate) fn actor(&self, container: ContainerId, id: ActorId) -> Option<&Actor> {
        self.actors.get(&id).filter(|a| a.container == container)
    }

    pub(crate) fn site(&self, container: ContainerId, id: SiteId) -> Option<&Site> {
        self.sites.get(&id).filter(|s| s.container == container)
    }

    /// Global unique ids of every vial mapped into the given request, in
    /// insertion order.
    pub(crate) fn vials_in_request(&self, request_id: RequestId) -> Vec<String> {
        self.vial_mappings
            .iter()
            .filter(|m| m.request_id == request_id)
            .map(|m| m.global_unique_id.clone())
            .collect()
    }

    /// Requests of the container that currently claim the given vial.
    pub(crate) fn requests_claiming(
        &self,
        container: ContainerId,
        global_unique_id: &str,
    ) -> Vec<RequestId> {
        self.vial_mappings
            .iter()
            .filter(|m| m.container == container && m.global_unique_id == global_unique_id)
            .map(|m| m.request_id)
            .collect()
    }

    /// Whether the request's status marks it terminal.
    pub(crate) fn is_final(&self, request: &Request) -> bool {
        self.status(request.container, request.status_id)
            .map(|s| s.is_final_state)
            .unwrap_or(false)
    }

    /// Whether the request's status forbids vial-set changes.
    pub(crate) fn locks_specimens(&self, request: &Request) -> bool {
        self.status(request.container, request.status_id)
            .map(|s| s.locks_specimens)
            .unwrap_or(false)
    }

    /// Live requirements attached to the given request, in id order.
    pub(crate) fn requirements_for(&self, request_id: RequestId) -> Vec<Requirement> {
        self.requirements
            .values()
            .filter(|r| r.owner == RequirementOwner::Request(request_id))
            .cloned()
            .collect()
    }

    /// Appends an audit event and returns it.
    pub(crate) fn record_event(
        &mut self,
        container: ContainerId,
        request_id: RequestId,
        requirement_id: Option<RequirementId>,
        event_type: RequestEventType,
        summary: impl Into<String>,
        created_by: UserId,
    ) -> RequestEvent {
        let event = RequestEvent {
            id: EventId(self.allocate_id()),
            container,
            request_id,
            requirement_id,
            event_type,
            summary: summary.into(),
            created_by,
            created: Utc::now(),
        };
        self.events.push(event.clone());
        event
    }
}

/// Shared handle to the study's relational state.
///
/// Cheap to share via `Arc`; every service in this crate is constructed with
/// one plus the container it operates on.
#[derive(Default)]
pub struct StudyStore {
    state: RwLock<StoreState>,
}

impl StudyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        // A poisoned lock only means a panic mid-read elsewhere; the state
        // itself is still usable because writers apply validated plans.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers or replaces a site. Site data mirrors the host's location
    /// registry; the core only needs identity and label.
    pub fn upsert_site(&self, site: Site) {
        self.write().sites.insert(site.id, site);
    }

    /// Sites of a container, ordered by label then id.
    pub fn sites(&self, container: ContainerId) -> Vec<Site> {
        let state = self.read();
        let mut sites: Vec<Site> = state
            .sites
            .values()
            .filter(|s| s.container == container)
            .cloned()
            .collect();
        sites.sort_by(|a, b| {
            a.label
                .sort_key()
                .cmp(&b.label.sort_key())
                .then(a.id.cmp(&b.id))
        });
        sites
    }

    /// Full audit trail of a request, oldest first.
    pub fn events_for_request(&self, request_id: RequestId) -> Vec<RequestEvent> {
        self.read()
            .events
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect()
    }
}
