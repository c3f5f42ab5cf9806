//! Request aggregate: lifecycle and vial-set invariants.
//!
//! A request is created in the shopping cart, gathers vials while its status
//! permits, is submitted into the administrator-defined workflow and ends in a
//! final status. Two invariants are enforced here and nowhere else:
//!
//! - **Exclusivity**: a vial belongs to at most one non-final request at a
//!   time. Racing additions are serialised by the store's write guard, so the
//!   loser receives an ordinary validation failure.
//! - **Immutability**: once the request's status locks specimens, its vial
//!   set cannot change (status changes remain possible); once the status is
//!   final, nothing can change. The only exception is the administrative
//!   cleanup of vials that no longer resolve to a physical specimen.
//!
//! Every vial-set mutation consults the requestability rule engine inside the
//! same transaction; a misconfigured rule aborts the whole batch.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::CoreConfig;
use crate::error::{RequestError, RequestResult};
use crate::events::RequestEventType;
use crate::model::{ContainerId, Request, RequestId, SiteId, StatusId, User};
use crate::requirements::generate_defaults_locked;
use crate::rules::{evaluate, unavailable_message, RuleContext};
use crate::specimens::{SpecimenRepository, Vial};
use crate::store::{StoreState, StudyStore, VialMapping};

/// Lifecycle operations on the requests of one container.
pub struct RequestService {
    store: Arc<StudyStore>,
    specimens: Arc<dyn SpecimenRepository>,
    config: Arc<CoreConfig>,
    container: ContainerId,
}

impl RequestService {
    pub fn new(
        store: Arc<StudyStore>,
        specimens: Arc<dyn SpecimenRepository>,
        config: Arc<CoreConfig>,
        container: ContainerId,
    ) -> Self {
        Self {
            store,
            specimens,
            config,
            container,
        }
    }

    /// Creates a new request in the shopping-cart status and seeds its
    /// default requirements.
    ///
    /// # Errors
    ///
    /// `Permission` when requests are disabled or the caller may not request
    /// specimens; `NotFound` for an unknown destination site.
    pub fn create(
        &self,
        user: &User,
        destination_site_id: SiteId,
        comments: Option<String>,
    ) -> RequestResult<Request> {
        if !self.config.requests_enabled() {
            return Err(RequestError::Permission(
                "specimen requests are not enabled for this study".to_owned(),
            ));
        }
        if !(user.request_specimens || user.manage_requests) {
            return Err(RequestError::Permission(
                "you do not have permission to create specimen requests".to_owned(),
            ));
        }

        let mut state = self.store.write();
        if state.site(self.container, destination_site_id).is_none() {
            return Err(RequestError::not_found(format!(
                "site {}",
                destination_site_id.0
            )));
        }
        let cart_status = state.ensure_system_status(self.container);
        let now = Utc::now();
        let id = RequestId(state.allocate_id());
        let request = Request {
            id,
            container: self.container,
            entity_id: Uuid::new_v4(),
            destination_site_id,
            status_id: cart_status,
            comments,
            created_by: user.id,
            created: now,
            modified: now,
        };
        state.requests.insert(id, request.clone());
        state.record_event(
            self.container,
            id,
            None,
            RequestEventType::RequestCreated,
            "Request created.",
            user.id,
        );
        generate_defaults_locked(&mut state, self.specimens.as_ref(), self.container, user, id)?;
        tracing::info!(request = id.0, "created specimen request");
        Ok(request)
    }

    pub fn request(&self, id: RequestId) -> RequestResult<Request> {
        self.store
            .read()
            .request(self.container, id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))
    }

    /// All requests of the container, in creation order.
    pub fn requests(&self) -> Vec<Request> {
        let state = self.store.read();
        let mut requests: Vec<Request> = state
            .requests
            .values()
            .filter(|r| r.container == self.container)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.id);
        requests
    }

    /// Global unique ids of the request's vials, in the order they were
    /// added.
    pub fn vials(&self, id: RequestId) -> RequestResult<Vec<String>> {
        let state = self.store.read();
        if state.request(self.container, id).is_none() {
            return Err(RequestError::not_found(format!("request {}", id.0)));
        }
        Ok(state.vials_in_request(id))
    }

    /// Whether the request's current status forbids vial-set changes.
    pub fn is_locked(&self, id: RequestId) -> RequestResult<bool> {
        let state = self.store.read();
        let request = state
            .request(self.container, id)
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        Ok(state.locks_specimens(request))
    }

    /// Whether the request has reached a terminal status.
    pub fn is_final(&self, id: RequestId) -> RequestResult<bool> {
        let state = self.store.read();
        let request = state
            .request(self.container, id)
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        Ok(state.is_final(request))
    }

    /// Adds vials to the request, all-or-nothing.
    ///
    /// Every vial is resolved, evaluated against the requestability rules and
    /// checked for exclusivity before any mapping row is written; the first
    /// failure aborts the whole batch. Vials already in this request are
    /// skipped. Default requirements are re-generated afterwards, since new
    /// vials can introduce new originating/providing sites.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown request or vial; `Permission` when the
    /// caller may not edit the request; `Validation` when the request is
    /// locked or final, a vial is claimed by another active request, or a
    /// rule marks a vial unavailable; `InvalidRule` when a rule is
    /// misconfigured.
    pub fn add_vials(
        &self,
        user: &User,
        id: RequestId,
        global_unique_ids: &[String],
    ) -> RequestResult<()> {
        // Resolve before taking the write guard; the repository is external
        // and read-only here.
        let mut vials = Vec::with_capacity(global_unique_ids.len());
        for guid in global_unique_ids {
            let vial = self
                .specimens
                .vial(self.container, guid)
                .ok_or_else(|| RequestError::not_found(format!("specimen {guid}")))?;
            vials.push(vial);
        }
        let columns = self.specimens.column_names(self.container);

        let mut state = self.store.write();
        let request = state
            .request(self.container, id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        self.require_edit(&state, user, &request)?;
        if state.is_final(&request) {
            return Err(RequestError::validation(
                "the request is in a final state and cannot be changed",
            ));
        }
        if state.locks_specimens(&request) {
            return Err(RequestError::validation(
                "the request's specimens are locked; its vial set cannot be changed",
            ));
        }
        if vials.is_empty() {
            return Ok(());
        }

        let in_this_request: BTreeSet<String> =
            state.vials_in_request(id).into_iter().collect();
        let rules = state.rules.get(&self.container).cloned().unwrap_or_default();
        let ctx = build_rule_context(&state, self.container, columns);

        let mut accepted: Vec<&Vial> = Vec::new();
        for vial in &vials {
            if vial.container != self.container {
                return Err(RequestError::Validation(format!(
                    "specimen {} belongs to a different container",
                    vial.global_unique_id
                )));
            }
            if in_this_request.contains(&vial.global_unique_id) {
                continue;
            }

            // Exclusivity: no other non-final request may already claim it.
            let claimed_elsewhere = state
                .requests_claiming(self.container, &vial.global_unique_id)
                .into_iter()
                .filter(|other| *other != id)
                .any(|other| {
                    state
                        .request(self.container, other)
                        .map(|r| !state.is_final(r))
                        .unwrap_or(false)
                });
            if claimed_elsewhere {
                return Err(RequestError::Validation(unavailable_message(
                    vial,
                    Some("This vial is unavailable because it is locked in a specimen request."),
                )));
            }

            let verdict = evaluate(vial, &rules, &ctx)?;
            if !verdict.requestable {
                return Err(RequestError::Validation(unavailable_message(
                    vial,
                    verdict.reason.as_deref(),
                )));
            }
            accepted.push(vial);
        }

        for vial in accepted {
            state.vial_mappings.push(VialMapping {
                container: self.container,
                request_id: id,
                global_unique_id: vial.global_unique_id.clone(),
            });
            state.record_event(
                self.container,
                id,
                None,
                RequestEventType::SpecimenAdded,
                format!("Specimen {} added.", vial.global_unique_id),
                user.id,
            );
        }
        touch(&mut state, id);
        generate_defaults_locked(&mut state, self.specimens.as_ref(), self.container, user, id)?;
        Ok(())
    }

    /// Removes vials from the request. Vials not in the request are a
    /// per-vial no-op.
    pub fn remove_vials(
        &self,
        user: &User,
        id: RequestId,
        global_unique_ids: &[String],
    ) -> RequestResult<()> {
        let mut state = self.store.write();
        let request = state
            .request(self.container, id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        self.require_edit(&state, user, &request)?;
        if state.is_final(&request) {
            return Err(RequestError::validation(
                "the request is in a final state and cannot be changed",
            ));
        }
        if state.locks_specimens(&request) {
            return Err(RequestError::validation(
                "the request's specimens are locked; its vial set cannot be changed",
            ));
        }

        for guid in global_unique_ids {
            let before = state.vial_mappings.len();
            state
                .vial_mappings
                .retain(|m| !(m.request_id == id && m.global_unique_id == *guid));
            if state.vial_mappings.len() < before {
                state.record_event(
                    self.container,
                    id,
                    None,
                    RequestEventType::SpecimenRemoved,
                    format!("Specimen {guid} removed."),
                    user.id,
                );
            }
        }
        touch(&mut state, id);
        Ok(())
    }

    /// Replaces the request's comment text, recording a comment event when
    /// the text actually changes.
    pub fn update_comments(
        &self,
        user: &User,
        id: RequestId,
        comments: Option<String>,
    ) -> RequestResult<()> {
        let mut state = self.store.write();
        let request = state
            .request(self.container, id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        self.require_edit(&state, user, &request)?;
        if state.is_final(&request) {
            return Err(RequestError::validation(
                "the request is in a final state and cannot be changed",
            ));
        }
        if request.comments == comments {
            return Ok(());
        }

        let mut updated = request;
        updated.comments = comments;
        updated.modified = Utc::now();
        state.requests.insert(id, updated);
        state.record_event(
            self.container,
            id,
            None,
            RequestEventType::CommentAdded,
            "Comments changed.",
            user.id,
        );
        Ok(())
    }

    /// Moves the request to another status.
    ///
    /// Allowed regardless of the specimen lock, which governs the vial set
    /// and not the status itself; rejected once the request is final.
    pub fn change_status(
        &self,
        user: &User,
        id: RequestId,
        new_status_id: StatusId,
    ) -> RequestResult<()> {
        if !user.manage_requests {
            return Err(RequestError::Permission(
                "you do not have permission to manage specimen requests".to_owned(),
            ));
        }
        let mut state = self.store.write();
        let request = state
            .request(self.container, id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        let old_status = state
            .status(self.container, request.status_id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("status {}", request.status_id.0)))?;
        if old_status.is_final_state {
            return Err(RequestError::validation(
                "the request is in a final state; its status cannot change",
            ));
        }
        let new_status = state
            .status(self.container, new_status_id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("status {}", new_status_id.0)))?;

        let mut updated = request;
        updated.status_id = new_status_id;
        updated.modified = Utc::now();
        state.requests.insert(id, updated);
        state.record_event(
            self.container,
            id,
            None,
            RequestEventType::RequestStatusChanged,
            format!(
                "Status changed from \"{}\" to \"{}\".",
                old_status.label, new_status.label
            ),
            user.id,
        );
        Ok(())
    }

    /// Submits a shopping-cart request into the workflow.
    ///
    /// # Errors
    ///
    /// `Permission` when the shopping cart is disabled or the caller may not
    /// edit the request; `Validation` when the request is not in the cart,
    /// contains no specimens, or no post-submission status is configured.
    pub fn submit(&self, user: &User, id: RequestId) -> RequestResult<()> {
        if !self.config.shopping_cart_enabled() {
            return Err(RequestError::Permission(
                "the specimen shopping cart is not enabled for this study".to_owned(),
            ));
        }
        let mut state = self.store.write();
        let request = state
            .request(self.container, id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        self.require_edit(&state, user, &request)?;
        if !in_cart(&state, &request) {
            return Err(RequestError::validation(
                "only requests in the shopping cart can be submitted",
            ));
        }
        if state.vials_in_request(id).is_empty() {
            return Err(RequestError::validation(
                "Only requests containing specimens can be submitted.",
            ));
        }
        let initial = state
            .initial_post_submission_status(self.container)
            .ok_or_else(|| {
                RequestError::validation(
                    "no request status beyond the shopping cart has been configured",
                )
            })?;

        let mut updated = request;
        updated.status_id = initial.id;
        updated.modified = Utc::now();
        state.requests.insert(id, updated);
        state.record_event(
            self.container,
            id,
            None,
            RequestEventType::RequestStatusChanged,
            "Request submitted for processing.",
            user.id,
        );
        tracing::info!(request = id.0, "submitted specimen request");
        Ok(())
    }

    /// Permanently deletes a shopping-cart request with its mapping rows,
    /// live requirements and audit events.
    ///
    /// # Errors
    ///
    /// `Permission` when the request has left the shopping cart or the caller
    /// may not edit it.
    pub fn delete(&self, user: &User, id: RequestId) -> RequestResult<()> {
        let mut state = self.store.write();
        let request = state
            .request(self.container, id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        self.require_edit(&state, user, &request)?;
        if !in_cart(&state, &request) {
            return Err(RequestError::Permission(
                "only requests still in the shopping cart can be deleted".to_owned(),
            ));
        }

        state.vial_mappings.retain(|m| m.request_id != id);
        state
            .requirements
            .retain(|_, r| r.request_id() != Some(id));
        state.events.retain(|e| e.request_id != id);
        state.requests.remove(&id);
        tracing::info!(request = id.0, "deleted specimen request");
        Ok(())
    }

    /// Administrative cleanup: removes mapping rows whose vial no longer
    /// resolves to a physical specimen. Permitted even when the request is
    /// locked or final, since it only reconciles the vial set with reality.
    /// Returns how many rows were removed.
    pub fn delete_missing_specimens(&self, user: &User, id: RequestId) -> RequestResult<usize> {
        if !user.admin {
            return Err(RequestError::Permission(
                "only administrators can delete missing specimens".to_owned(),
            ));
        }
        let mut state = self.store.write();
        if state.request(self.container, id).is_none() {
            return Err(RequestError::not_found(format!("request {}", id.0)));
        }

        let stale: Vec<String> = state
            .vials_in_request(id)
            .into_iter()
            .filter(|guid| self.specimens.vial(self.container, guid).is_none())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        state
            .vial_mappings
            .retain(|m| !(m.request_id == id && stale.contains(&m.global_unique_id)));
        state.record_event(
            self.container,
            id,
            None,
            RequestEventType::SpecimenRemoved,
            format!(
                "Removed {} specimen(s) that no longer exist in the specimen repository: {}",
                stale.len(),
                stale.join(", ")
            ),
            user.id,
        );
        touch(&mut state, id);
        Ok(stale.len())
    }

    /// Whether every live requirement of the request is complete, vacuously
    /// true with none. Callers that gate submission on the checklist use
    /// this.
    pub fn requirements_complete(&self, id: RequestId) -> RequestResult<bool> {
        let state = self.store.read();
        if state.request(self.container, id).is_none() {
            return Err(RequestError::not_found(format!("request {}", id.0)));
        }
        Ok(state.requirements_for(id).iter().all(|r| r.complete))
    }

    /// Whether the caller may edit the request: request managers always can;
    /// the creator can while the request sits in their shopping cart.
    pub fn can_edit(&self, user: &User, id: RequestId) -> RequestResult<bool> {
        let state = self.store.read();
        let request = state
            .request(self.container, id)
            .ok_or_else(|| RequestError::not_found(format!("request {}", id.0)))?;
        Ok(can_edit_request(&state, user, request))
    }

    fn require_edit(
        &self,
        state: &StoreState,
        user: &User,
        request: &Request,
    ) -> RequestResult<()> {
        if can_edit_request(state, user, request) {
            Ok(())
        } else {
            Err(RequestError::Permission(
                "you do not have permission to modify this specimen request".to_owned(),
            ))
        }
    }
}

fn can_edit_request(state: &StoreState, user: &User, request: &Request) -> bool {
    if user.manage_requests {
        return true;
    }
    in_cart(state, request) && request.created_by == user.id
}

fn in_cart(state: &StoreState, request: &Request) -> bool {
    state
        .status(request.container, request.status_id)
        .map(|s| s.is_system_status)
        .unwrap_or(false)
}

fn touch(state: &mut StoreState, id: RequestId) {
    if let Some(request) = state.requests.get(&id).cloned() {
        let mut updated = request;
        updated.modified = Utc::now();
        state.requests.insert(id, updated);
    }
}

/// Snapshot of the cross-request state the rule engine consults, built under
/// the same write guard that will apply the mutation.
fn build_rule_context(
    state: &StoreState,
    container: ContainerId,
    columns: BTreeSet<String>,
) -> RuleContext {
    let mut locked_in_request = BTreeSet::new();
    let mut processing = BTreeSet::new();
    for mapping in state
        .vial_mappings
        .iter()
        .filter(|m| m.container == container)
    {
        let Some(request) = state.request(container, mapping.request_id) else {
            continue;
        };
        if state.is_final(request) {
            continue;
        }
        locked_in_request.insert(mapping.global_unique_id.clone());
        if state.locks_specimens(request) {
            processing.insert(mapping.global_unique_id.clone());
        }
    }
    RuleContext {
        locked_in_request,
        processing,
        columns,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use srt_types::Label;

    use crate::model::{
        ActorId, Requirement, RequirementId, RequirementKind, RequirementOwner, Site, UserId,
    };
    use crate::rules::{CustomQueryRule, RequestableRule, RuleRegistry};
    use crate::specimens::InMemorySpecimenVault;
    use crate::statuses::{StatusRegistry, StatusUpdate};

    const CONTAINER: ContainerId = ContainerId(1);

    struct Fixture {
        store: Arc<StudyStore>,
        vault: Arc<InMemorySpecimenVault>,
        service: RequestService,
        statuses: StatusRegistry,
        rules: RuleRegistry,
        admin: User,
        dest: SiteId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(StudyStore::new());
        let vault = Arc::new(InMemorySpecimenVault::new());
        let config = Arc::new(CoreConfig::default());
        let service = RequestService::new(
            Arc::clone(&store),
            Arc::clone(&vault) as Arc<dyn SpecimenRepository>,
            config,
            CONTAINER,
        );
        let statuses = StatusRegistry::new(Arc::clone(&store), CONTAINER);
        let rules = RuleRegistry::new(Arc::clone(&store), CONTAINER);
        let dest = SiteId(100);
        store.upsert_site(Site {
            id: dest,
            container: CONTAINER,
            label: Label::new("Receiving Hospital").expect("valid label"),
        });
        Fixture {
            store,
            vault,
            service,
            statuses,
            rules,
            admin: User::admin(UserId(1)),
            dest,
        }
    }

    fn label(text: &str) -> Label {
        Label::new(text).expect("valid label")
    }

    fn put_vial(f: &Fixture, guid: &str) {
        f.vault.put_vial(Vial {
            row_id: 1,
            global_unique_id: guid.to_owned(),
            container: CONTAINER,
            current_location_id: None,
            originating_location_id: None,
            available: true,
            at_repository: true,
            requestable: None,
            attributes: BTreeMap::new(),
        });
    }

    fn processing_status(f: &Fixture) -> StatusId {
        let status = f.statuses.create(label("Processing")).expect("create status");
        status.id
    }

    fn locking_status(f: &Fixture, name: &str) -> StatusId {
        let status = f.statuses.create(label(name)).expect("create status");
        f.statuses
            .update(
                status.id,
                StatusUpdate {
                    label: None,
                    is_final_state: None,
                    locks_specimens: Some(true),
                },
            )
            .expect("update status");
        status.id
    }

    fn final_status(f: &Fixture) -> StatusId {
        let status = f.statuses.create(label("Complete")).expect("create status");
        f.statuses
            .update(
                status.id,
                StatusUpdate {
                    label: None,
                    is_final_state: Some(true),
                    locks_specimens: Some(true),
                },
            )
            .expect("update status");
        status.id
    }

    #[test]
    fn submit_requires_specimens_and_stays_in_cart() {
        let f = fixture();
        processing_status(&f);
        let request = f
            .service
            .create(&f.admin, f.dest, None)
            .expect("create request");

        let err = f
            .service
            .submit(&f.admin, request.id)
            .expect_err("empty requests cannot be submitted");
        match err {
            RequestError::Validation(message) => {
                assert_eq!(message, "Only requests containing specimens can be submitted.");
            }
            other => panic!("expected Validation error, got {other:?}"),
        }

        let cart = f.statuses.shopping_cart_status();
        let reloaded = f.service.request(request.id).expect("request persists");
        assert_eq!(reloaded.status_id, cart.id);
    }

    #[test]
    fn submit_moves_to_first_post_cart_status() {
        let f = fixture();
        let processing = processing_status(&f);
        let request = f
            .service
            .create(&f.admin, f.dest, None)
            .expect("create request");
        put_vial(&f, "V-1");
        f.service
            .add_vials(&f.admin, request.id, &["V-1".to_owned()])
            .expect("add vial");

        f.service.submit(&f.admin, request.id).expect("submit");

        let reloaded = f.service.request(request.id).expect("request exists");
        assert_eq!(reloaded.status_id, processing);
        let events = f.store.events_for_request(request.id);
        assert!(events
            .iter()
            .any(|e| e.summary == "Request submitted for processing."));
    }

    #[test]
    fn vial_claimed_by_active_request_is_rejected_elsewhere() {
        let f = fixture();
        processing_status(&f);
        put_vial(&f, "V-1");

        let r1 = f.service.create(&f.admin, f.dest, None).expect("create r1");
        let r2 = f.service.create(&f.admin, f.dest, None).expect("create r2");
        f.service
            .add_vials(&f.admin, r1.id, &["V-1".to_owned()])
            .expect("claim vial in r1");

        let err = f
            .service
            .add_vials(&f.admin, r2.id, &["V-1".to_owned()])
            .expect_err("the vial is already claimed");
        match err {
            RequestError::Validation(message) => {
                assert!(message.contains("V-1"), "message was: {message}");
            }
            other => panic!("expected Validation error, got {other:?}"),
        }
        assert!(f.service.vials(r2.id).expect("r2 exists").is_empty());
    }

    #[test]
    fn final_requests_release_their_claims() {
        let f = fixture();
        let done = final_status(&f);
        put_vial(&f, "V-1");

        let r1 = f.service.create(&f.admin, f.dest, None).expect("create r1");
        f.service
            .add_vials(&f.admin, r1.id, &["V-1".to_owned()])
            .expect("claim vial in r1");
        f.service
            .change_status(&f.admin, r1.id, done)
            .expect("finalise r1");

        let r2 = f.service.create(&f.admin, f.dest, None).expect("create r2");
        f.service
            .add_vials(&f.admin, r2.id, &["V-1".to_owned()])
            .expect("a finalised request no longer claims the vial");
    }

    #[test]
    fn lock_is_monotonic_across_locking_statuses() {
        let f = fixture();
        let lock_a = locking_status(&f, "In Processing");
        let lock_b = locking_status(&f, "Shipping");
        put_vial(&f, "V-1");
        put_vial(&f, "V-2");

        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        f.service
            .add_vials(&f.admin, request.id, &["V-1".to_owned()])
            .expect("add while in cart");

        f.service
            .change_status(&f.admin, request.id, lock_a)
            .expect("move to locking status");
        let err = f
            .service
            .add_vials(&f.admin, request.id, &["V-2".to_owned()])
            .expect_err("adds rejected while locked");
        assert!(matches!(err, RequestError::Validation(_)));
        let err = f
            .service
            .remove_vials(&f.admin, request.id, &["V-1".to_owned()])
            .expect_err("removes rejected while locked");
        assert!(matches!(err, RequestError::Validation(_)));

        // A further status change to another locking status keeps the lock.
        f.service
            .change_status(&f.admin, request.id, lock_b)
            .expect("status changes stay possible while locked");
        let err = f
            .service
            .add_vials(&f.admin, request.id, &["V-2".to_owned()])
            .expect_err("still locked");
        assert!(matches!(err, RequestError::Validation(_)));
        assert_eq!(
            f.service.vials(request.id).expect("request exists"),
            vec!["V-1".to_owned()]
        );
    }

    #[test]
    fn status_cannot_change_once_final() {
        let f = fixture();
        let processing = processing_status(&f);
        let done = final_status(&f);
        let request = f.service.create(&f.admin, f.dest, None).expect("create");

        f.service
            .change_status(&f.admin, request.id, done)
            .expect("move to final status");
        let err = f
            .service
            .change_status(&f.admin, request.id, processing)
            .expect_err("final requests are immutable");
        assert!(matches!(err, RequestError::Validation(_)));
    }

    #[test]
    fn delete_is_restricted_to_the_shopping_cart() {
        let f = fixture();
        processing_status(&f);
        put_vial(&f, "V-1");
        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        f.service
            .add_vials(&f.admin, request.id, &["V-1".to_owned()])
            .expect("add vial");
        f.service.submit(&f.admin, request.id).expect("submit");

        let err = f
            .service
            .delete(&f.admin, request.id)
            .expect_err("submitted requests cannot be deleted");
        assert!(matches!(err, RequestError::Permission(_)));
        f.service.request(request.id).expect("request persists");
    }

    #[test]
    fn deleting_a_cart_request_removes_its_rows() {
        let f = fixture();
        put_vial(&f, "V-1");
        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        f.service
            .add_vials(&f.admin, request.id, &["V-1".to_owned()])
            .expect("add vial");

        f.service.delete(&f.admin, request.id).expect("delete");

        let err = f.service.request(request.id).expect_err("request is gone");
        assert!(matches!(err, RequestError::NotFound(_)));
        let state = f.store.read();
        assert!(state.vial_mappings.is_empty());
        assert!(state.events.is_empty());
        assert!(state
            .requirements
            .values()
            .all(|r| r.request_id() != Some(request.id)));
    }

    #[test]
    fn invalid_rule_aborts_the_whole_batch() {
        let f = fixture();
        put_vial(&f, "V-1");
        put_vial(&f, "V-2");
        f.rules.save_rules(vec![RequestableRule::CustomQuery(CustomQueryRule {
            column: "NoSuchColumn".to_owned(),
            matches: "x".to_owned(),
            mark_available: true,
        })]);

        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        let err = f
            .service
            .add_vials(
                &f.admin,
                request.id,
                &["V-1".to_owned(), "V-2".to_owned()],
            )
            .expect_err("misconfigured rules abort the mutation");
        match err {
            RequestError::InvalidRule { message } => {
                assert!(message.contains("NoSuchColumn"));
            }
            other => panic!("expected InvalidRule error, got {other:?}"),
        }
        assert!(f.service.vials(request.id).expect("request exists").is_empty());
    }

    #[test]
    fn one_unavailable_vial_rejects_the_whole_batch() {
        let f = fixture();
        f.rules.set_default_rules();
        put_vial(&f, "V-1");
        f.vault.put_vial(Vial {
            row_id: 2,
            global_unique_id: "V-2".to_owned(),
            container: CONTAINER,
            current_location_id: None,
            originating_location_id: None,
            available: true,
            at_repository: true,
            requestable: Some(false),
            attributes: BTreeMap::new(),
        });

        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        let err = f
            .service
            .add_vials(
                &f.admin,
                request.id,
                &["V-1".to_owned(), "V-2".to_owned()],
            )
            .expect_err("the override rule marks V-2 unavailable");
        match err {
            RequestError::Validation(message) => {
                assert!(message.starts_with("Specimen V-2"), "message was: {message}");
            }
            other => panic!("expected Validation error, got {other:?}"),
        }
        assert!(
            f.service.vials(request.id).expect("request exists").is_empty(),
            "all-or-nothing: the available vial must not have been added"
        );
    }

    #[test]
    fn missing_specimen_cleanup_removes_stale_rows_even_while_locked() {
        let f = fixture();
        let lock = locking_status(&f, "In Processing");
        put_vial(&f, "V-1");
        put_vial(&f, "V-2");
        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        f.service
            .add_vials(
                &f.admin,
                request.id,
                &["V-1".to_owned(), "V-2".to_owned()],
            )
            .expect("add vials");
        f.service
            .change_status(&f.admin, request.id, lock)
            .expect("lock the request");

        // V-2 disappears from a later specimen feed.
        assert!(f.vault.remove_vial(CONTAINER, "V-2"));

        let removed = f
            .service
            .delete_missing_specimens(&f.admin, request.id)
            .expect("cleanup runs while locked");
        assert_eq!(removed, 1);
        assert_eq!(
            f.service.vials(request.id).expect("request exists"),
            vec!["V-1".to_owned()]
        );

        let requester = User::requester(UserId(2));
        let err = f
            .service
            .delete_missing_specimens(&requester, request.id)
            .expect_err("cleanup is admin-only");
        assert!(matches!(err, RequestError::Permission(_)));
    }

    #[test]
    fn creators_can_edit_their_own_cart_request_only() {
        let f = fixture();
        processing_status(&f);
        put_vial(&f, "V-1");
        let owner = User::requester(UserId(10));
        let stranger = User::requester(UserId(11));

        let request = f.service.create(&owner, f.dest, None).expect("create");
        f.service
            .add_vials(&owner, request.id, &["V-1".to_owned()])
            .expect("creators edit their cart request");

        let err = f
            .service
            .remove_vials(&stranger, request.id, &["V-1".to_owned()])
            .expect_err("strangers cannot edit the request");
        assert!(matches!(err, RequestError::Permission(_)));

        // After submission even the creator needs the manage capability.
        f.service.submit(&owner, request.id).expect("submit");
        let err = f
            .service
            .remove_vials(&owner, request.id, &["V-1".to_owned()])
            .expect_err("cart-creator permission ends at submission");
        assert!(matches!(err, RequestError::Permission(_)));
    }

    #[test]
    fn concurrent_adds_claim_a_vial_exactly_once() {
        let f = fixture();
        put_vial(&f, "V-1");
        let r1 = f.service.create(&f.admin, f.dest, None).expect("create r1");
        let r2 = f.service.create(&f.admin, f.dest, None).expect("create r2");

        let service = &f.service;
        let admin = &f.admin;
        let ids = [r1.id, r2.id];
        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = ids
                .iter()
                .map(|&id| {
                    scope.spawn(move || {
                        service.add_vials(admin, id, &["V-1".to_owned()]).is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("add thread panicked"))
                .collect()
        });

        let successes = results.iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1, "exactly one racing add may claim the vial");
        let claims = f.store.read().requests_claiming(CONTAINER, "V-1");
        assert_eq!(claims.len(), 1, "exactly one mapping row must exist");
    }

    #[test]
    fn empty_batches_still_validate_the_request() {
        let f = fixture();

        let err = f
            .service
            .add_vials(&f.admin, RequestId(404), &[])
            .expect_err("unknown requests are rejected even with nothing to add");
        assert!(matches!(err, RequestError::NotFound(_)));

        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        let stranger = User::requester(UserId(9));
        let err = f
            .service
            .add_vials(&stranger, request.id, &[])
            .expect_err("permission checks run before the batch is inspected");
        assert!(matches!(err, RequestError::Permission(_)));
        f.service
            .add_vials(&f.admin, request.id, &[])
            .expect("a valid empty batch is a no-op");
    }

    #[test]
    fn comment_updates_record_an_event_only_on_change() {
        let f = fixture();
        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        let baseline = f.store.events_for_request(request.id).len();

        f.service
            .update_comments(&f.admin, request.id, Some("Urgent".to_owned()))
            .expect("update comments");
        let reloaded = f.service.request(request.id).expect("request exists");
        assert_eq!(reloaded.comments.as_deref(), Some("Urgent"));
        let events = f.store.events_for_request(request.id);
        assert_eq!(events.len(), baseline + 1);
        let last = events.last().expect("event recorded");
        assert_eq!(last.event_type, RequestEventType::CommentAdded);

        // Re-asserting the same text records nothing.
        f.service
            .update_comments(&f.admin, request.id, Some("Urgent".to_owned()))
            .expect("no-op update");
        assert_eq!(f.store.events_for_request(request.id).len(), baseline + 1);
    }

    #[test]
    fn requirements_complete_tracks_the_checklist() {
        let f = fixture();
        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        assert!(
            f.service
                .requirements_complete(request.id)
                .expect("request exists"),
            "vacuously true with no requirements"
        );

        let requirement_id = {
            let mut state = f.store.write();
            let id = RequirementId(state.allocate_id());
            state.requirements.insert(
                id,
                Requirement {
                    id,
                    container: CONTAINER,
                    owner: RequirementOwner::Request(request.id),
                    kind: RequirementKind::NonSite,
                    actor_id: ActorId(1),
                    site_id: None,
                    description: "QA review".to_owned(),
                    complete: false,
                },
            );
            id
        };
        assert!(!f
            .service
            .requirements_complete(request.id)
            .expect("request exists"));

        {
            let mut state = f.store.write();
            let mut updated = state.requirements[&requirement_id].clone();
            updated.complete = true;
            state.requirements.insert(requirement_id, updated);
        }
        assert!(f
            .service
            .requirements_complete(request.id)
            .expect("request exists"));
    }

    #[test]
    fn can_edit_reflects_cart_ownership() {
        let f = fixture();
        let owner = User::requester(UserId(10));
        let stranger = User::requester(UserId(11));
        put_vial(&f, "V-1");
        processing_status(&f);

        let request = f.service.create(&owner, f.dest, None).expect("create");
        assert!(f.service.can_edit(&owner, request.id).expect("request exists"));
        assert!(!f
            .service
            .can_edit(&stranger, request.id)
            .expect("request exists"));
        assert!(f.service.can_edit(&f.admin, request.id).expect("request exists"));

        f.service
            .add_vials(&owner, request.id, &["V-1".to_owned()])
            .expect("add vial");
        f.service.submit(&owner, request.id).expect("submit");
        assert!(
            !f.service.can_edit(&owner, request.id).expect("request exists"),
            "cart-creator permission ends at submission"
        );
        assert!(f.service.can_edit(&f.admin, request.id).expect("request exists"));
    }

    #[test]
    fn removing_an_absent_vial_is_a_no_op() {
        let f = fixture();
        put_vial(&f, "V-1");
        let request = f.service.create(&f.admin, f.dest, None).expect("create");
        f.service
            .add_vials(&f.admin, request.id, &["V-1".to_owned()])
            .expect("add vial");
        let baseline = f.store.events_for_request(request.id).len();

        f.service
            .remove_vials(
                &f.admin,
                request.id,
                &["V-404".to_owned(), "V-1".to_owned()],
            )
            .expect("absent vials are skipped");
        assert!(f.service.vials(request.id).expect("request exists").is_empty());
        assert_eq!(
            f.store.events_for_request(request.id).len(),
            baseline + 1,
            "only the real removal records an event"
        );
    }
}
