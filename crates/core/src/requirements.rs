//! Requirement engine: per-request approval checklists.
//!
//! Administrators define default requirement templates per kind (originating
//! site, providing site, receiving site, non-site). When a request takes
//! shape, each applicable template is cloned into a live requirement attached
//! to that request; live requirements are completed independently and every
//! change is recorded in the audit trail. The engine only reports whether all
//! requirements are complete; callers decide whether to gate submission on it.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{RequestError, RequestResult};
use crate::events::RequestEventType;
use crate::model::{
    ActorId, ContainerId, RequestId, Requirement, RequirementId, RequirementKind,
    RequirementOwner, SiteId, User,
};
use crate::specimens::SpecimenRepository;
use crate::store::{StoreState, StudyStore};

/// Checklist operations for one container.
pub struct RequirementEngine {
    store: Arc<StudyStore>,
    specimens: Arc<dyn SpecimenRepository>,
    container: ContainerId,
}

impl RequirementEngine {
    pub fn new(
        store: Arc<StudyStore>,
        specimens: Arc<dyn SpecimenRepository>,
        container: ContainerId,
    ) -> Self {
        Self {
            store,
            specimens,
            container,
        }
    }

    /// Creates a default template cloned into every applicable new request.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::NotFound`] when the actor does not exist, and
    /// [`RequestError::Validation`] when the actor's scope does not fit the
    /// kind: site-flavoured templates need a per-site actor, non-site
    /// templates a study-wide one.
    pub fn create_template(
        &self,
        kind: RequirementKind,
        actor_id: ActorId,
        description: impl Into<String>,
    ) -> RequestResult<Requirement> {
        let mut state = self.store.write();
        let actor = state
            .actor(self.container, actor_id)
            .ok_or_else(|| RequestError::not_found(format!("actor {}", actor_id.0)))?;

        let site_scoped = !matches!(kind, RequirementKind::NonSite);
        if site_scoped != actor.is_per_site() {
            return Err(RequestError::Validation(format!(
                "actor '{}' cannot take {kind:?} requirements: its scope does not match",
                actor.label
            )));
        }

        let id = RequirementId(state.allocate_id());
        let template = Requirement {
            id,
            container: self.container,
            owner: RequirementOwner::Template,
            kind,
            actor_id,
            site_id: None,
            description: description.into(),
            complete: false,
        };
        state.requirements.insert(id, template.clone());
        Ok(template)
    }

    /// All default templates of the container, in creation order.
    pub fn templates(&self) -> Vec<Requirement> {
        self.store
            .read()
            .requirements
            .values()
            .filter(|r| r.container == self.container && r.owner == RequirementOwner::Template)
            .cloned()
            .collect()
    }

    /// Removes a default template. Unknown ids and non-template ids are a
    /// no-op; live requirements are deleted through [`Self::delete`].
    pub fn delete_template(&self, id: RequirementId) {
        let mut state = self.store.write();
        let is_template = state
            .requirements
            .get(&id)
            .map(|r| r.container == self.container && r.owner == RequirementOwner::Template)
            .unwrap_or(false);
        if is_template {
            state.requirements.remove(&id);
        }
    }

    /// Clones each applicable default template into a live requirement for
    /// the request.
    ///
    /// Receiving-site templates pair with the destination site;
    /// originating/providing templates with each distinct matching vial site;
    /// non-site templates attach with no site. Generation is idempotent: a
    /// live requirement with the same kind, actor and site is not added
    /// twice, so this runs again safely whenever the vial set grows.
    pub fn generate_defaults(
        &self,
        user: &User,
        request_id: RequestId,
    ) -> RequestResult<Vec<Requirement>> {
        let mut state = self.store.write();
        generate_defaults_locked(
            &mut state,
            self.specimens.as_ref(),
            self.container,
            user,
            request_id,
        )
    }

    /// Attaches a hand-made live requirement to a request.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown request/actor/site; `Permission` when the caller
    /// cannot manage requests; `Validation` when the request is final or the
    /// site presence does not match the actor's scope.
    pub fn add(
        &self,
        user: &User,
        request_id: RequestId,
        kind: RequirementKind,
        actor_id: ActorId,
        site_id: Option<SiteId>,
        description: impl Into<String>,
    ) -> RequestResult<Requirement> {
        if !user.manage_requests {
            return Err(RequestError::Permission(
                "you do not have permission to update requirements".to_owned(),
            ));
        }
        let mut state = self.store.write();
        let request = state
            .request(self.container, request_id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", request_id.0)))?;
        if state.is_final(&request) {
            return Err(RequestError::validation(
                "requirements cannot be added to a request in a final state",
            ));
        }
        let actor = state
            .actor(self.container, actor_id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("actor {}", actor_id.0)))?;
        if actor.is_per_site() != site_id.is_some() {
            return Err(RequestError::Validation(format!(
                "actor '{}' is {}, so a site {} be given",
                actor.label,
                if actor.is_per_site() { "per-site" } else { "study-wide" },
                if actor.is_per_site() { "must" } else { "must not" },
            )));
        }
        if let Some(site_id) = site_id {
            if state.site(self.container, site_id).is_none() {
                return Err(RequestError::not_found(format!("site {}", site_id.0)));
            }
        }

        let id = RequirementId(state.allocate_id());
        let requirement = Requirement {
            id,
            container: self.container,
            owner: RequirementOwner::Request(request_id),
            kind,
            actor_id,
            site_id,
            description: description.into(),
            complete: false,
        };
        state.requirements.insert(id, requirement.clone());
        let summary = requirement_summary(&state, &requirement);
        state.record_event(
            self.container,
            request_id,
            Some(id),
            RequestEventType::RequirementAdded,
            summary,
            user.id,
        );
        Ok(requirement)
    }

    /// Removes a live requirement, recording the removal in the audit trail.
    pub fn delete(&self, user: &User, requirement_id: RequirementId) -> RequestResult<()> {
        if !user.manage_requests {
            return Err(RequestError::Permission(
                "you do not have permission to update requirements".to_owned(),
            ));
        }
        let mut state = self.store.write();
        let requirement = state
            .requirements
            .get(&requirement_id)
            .filter(|r| r.container == self.container)
            .cloned()
            .ok_or_else(|| {
                RequestError::not_found(format!("requirement {}", requirement_id.0))
            })?;
        let Some(request_id) = requirement.request_id() else {
            return Err(RequestError::validation(
                "default templates are removed through delete_template",
            ));
        };
        if let Some(request) = state.request(self.container, request_id).cloned() {
            if state.is_final(&request) {
                return Err(RequestError::validation(
                    "requirements cannot be removed from a request in a final state",
                ));
            }
        }

        let summary = requirement_summary(&state, &requirement);
        state.requirements.remove(&requirement_id);
        state.record_event(
            self.container,
            request_id,
            Some(requirement_id),
            RequestEventType::RequirementRemoved,
            summary,
            user.id,
        );
        Ok(())
    }

    /// Sets a live requirement's completion flag.
    ///
    /// Records an audit event when the flag actually changes; setting a
    /// requirement to the state it is already in records nothing.
    pub fn set_complete(
        &self,
        user: &User,
        requirement_id: RequirementId,
        complete: bool,
    ) -> RequestResult<()> {
        if !user.manage_requests {
            return Err(RequestError::Permission(
                "you do not have permission to update requirements".to_owned(),
            ));
        }
        let mut state = self.store.write();
        let requirement = state
            .requirements
            .get(&requirement_id)
            .filter(|r| r.container == self.container)
            .cloned()
            .ok_or_else(|| {
                RequestError::not_found(format!("requirement {}", requirement_id.0))
            })?;
        let Some(request_id) = requirement.request_id() else {
            return Err(RequestError::validation(
                "default templates have no completion state",
            ));
        };
        if requirement.complete == complete {
            return Ok(());
        }

        let mut updated = requirement.clone();
        updated.complete = complete;
        state.requirements.insert(requirement_id, updated.clone());

        let summary = format!(
            "{}\nStatus changed to {}",
            requirement_summary(&state, &updated),
            if complete { "complete" } else { "incomplete" }
        );
        state.record_event(
            self.container,
            request_id,
            Some(requirement_id),
            RequestEventType::RequestStatusChanged,
            summary,
            user.id,
        );
        Ok(())
    }

    /// Whether every live requirement of the request is complete. Vacuously
    /// true when the request has none.
    pub fn all_complete(&self, request_id: RequestId) -> RequestResult<bool> {
        let state = self.store.read();
        if state.request(self.container, request_id).is_none() {
            return Err(RequestError::not_found(format!("request {}", request_id.0)));
        }
        Ok(state
            .requirements_for(request_id)
            .iter()
            .all(|r| r.complete))
    }

    /// Live requirements of the request, in id order.
    pub fn for_request(&self, request_id: RequestId) -> Vec<Requirement> {
        self.store.read().requirements_for(request_id)
    }
}

/// Human-readable requirement summary used in audit events:
/// `<actor> (<site>): <description>`.
pub(crate) fn requirement_summary(state: &StoreState, requirement: &Requirement) -> String {
    let actor = state
        .actor(requirement.container, requirement.actor_id)
        .map(|a| a.label.as_str().to_owned())
        .unwrap_or_else(|| format!("Deleted actor {}", requirement.actor_id.0));
    let site = requirement
        .site_id
        .and_then(|id| state.site(requirement.container, id))
        .map(|s| format!(" ({})", s.label));
    format!(
        "{}{}: {}",
        actor,
        site.unwrap_or_default(),
        requirement.description
    )
}

/// Template cloning shared between the engine and the request service, which
/// already holds the store's write guard when vials are added.
pub(crate) fn generate_defaults_locked(
    state: &mut StoreState,
    specimens: &dyn SpecimenRepository,
    container: ContainerId,
    user: &User,
    request_id: RequestId,
) -> RequestResult<Vec<Requirement>> {
    let request = state
        .request(container, request_id)
        .cloned()
        .ok_or_else(|| RequestError::not_found(format!("request {}", request_id.0)))?;

    let vial_ids = state.vials_in_request(request_id);
    let vials = specimens.vials_by_ids(container, &vial_ids);
    if vials.len() < vial_ids.len() {
        tracing::warn!(
            request = request_id.0,
            "some vials in the request no longer resolve; skipping them for defaults"
        );
    }
    let originating: BTreeSet<SiteId> = vials
        .iter()
        .filter_map(|v| v.originating_location_id)
        .collect();
    let providing: BTreeSet<SiteId> = vials
        .iter()
        .filter_map(|v| v.current_location_id)
        .collect();

    let templates: Vec<Requirement> = state
        .requirements
        .values()
        .filter(|r| r.container == container && r.owner == RequirementOwner::Template)
        .cloned()
        .collect();
    let existing: BTreeSet<(RequirementKind, ActorId, Option<SiteId>)> = state
        .requirements_for(request_id)
        .iter()
        .map(|r| (r.kind, r.actor_id, r.site_id))
        .collect();

    let mut created = Vec::new();
    for template in templates {
        let targets: Vec<Option<SiteId>> = match template.kind {
            RequirementKind::ReceivingSite => vec![Some(request.destination_site_id)],
            RequirementKind::NonSite => vec![None],
            RequirementKind::OriginatingSite => originating.iter().copied().map(Some).collect(),
            RequirementKind::ProvidingSite => providing.iter().copied().map(Some).collect(),
        };
        for site_id in targets {
            if existing.contains(&(template.kind, template.actor_id, site_id)) {
                continue;
            }
            let id = RequirementId(state.allocate_id());
            let requirement = Requirement {
                id,
                container,
                owner: RequirementOwner::Request(request_id),
                kind: template.kind,
                actor_id: template.actor_id,
                site_id,
                description: template.description.clone(),
                complete: false,
            };
            state.requirements.insert(id, requirement.clone());
            let summary = requirement_summary(state, &requirement);
            state.record_event(
                container,
                request_id,
                Some(id),
                RequestEventType::RequirementAdded,
                summary,
                user.id,
            );
            created.push(requirement);
        }
    }
    Ok(created)
}
