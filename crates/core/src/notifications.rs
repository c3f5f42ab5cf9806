//! Notification recipient resolution.
//!
//! Computes *who* could be notified about a request event: every actor/site
//! pairing that has a stake in the request. Delivery itself lives behind the
//! [`MailTransport`] trait and is best-effort: a transport failure after the
//! core mutation has committed is reported as a warning and never undoes the
//! mutation.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{RequestError, RequestResult};
use crate::model::{Actor, ActorId, ContainerId, RequestId, Site, SiteId};
use crate::specimens::SpecimenRepository;
use crate::store::StudyStore;

/// One addressable audience: an actor, optionally scoped to a site.
///
/// Study-wide actors carry no site; per-site actors are meaningful only
/// together with one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecipientSet {
    pub actor: Actor,
    pub site: Option<Site>,
}

impl RecipientSet {
    /// Identity key used for deduplication: "no site" is its own key, not a
    /// wildcard.
    fn key(&self) -> (ActorId, Option<SiteId>) {
        (self.actor.id, self.site.as_ref().map(|s| s.id))
    }

    fn sort_key(&self) -> (String, String) {
        let site = self
            .site
            .as_ref()
            .map(|s| s.label.sort_key())
            .unwrap_or_default();
        (site, self.actor.label.sort_key())
    }
}

impl fmt::Display for RecipientSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.site {
            Some(site) => write!(f, "{} ({})", self.actor.label, site.label),
            None => write!(f, "{}", self.actor.label),
        }
    }
}

/// Outgoing mail boundary, implemented by the host application.
pub trait MailTransport: Send + Sync {
    /// Delivers one message to every member of the recipient sets.
    ///
    /// # Errors
    ///
    /// Implementations report addressing or transport failures; callers treat
    /// them as post-commit warnings via [`notify`].
    fn send(&self, recipients: &[RecipientSet], subject: &str, body: &str) -> RequestResult<()>;
}

/// Best-effort delivery wrapper: the enclosing mutation has already
/// committed, so a transport failure is logged and surfaced as a
/// [`RequestError::NotificationDelivery`] warning for the caller to display,
/// never as a reason to roll anything back.
///
/// # Errors
///
/// Returns `NotificationDelivery` when the transport fails.
pub fn notify(
    transport: &dyn MailTransport,
    recipients: &[RecipientSet],
    subject: &str,
    body: &str,
) -> RequestResult<()> {
    if recipients.is_empty() {
        return Ok(());
    }
    transport.send(recipients, subject, body).map_err(|err| {
        tracing::warn!(error = %err, subject, "notification delivery failed after commit");
        RequestError::NotificationDelivery(err.to_string())
    })
}

/// Resolves the candidate notification audience of one container's requests.
pub struct NotificationResolver {
    store: Arc<StudyStore>,
    specimens: Arc<dyn SpecimenRepository>,
    container: ContainerId,
}

impl NotificationResolver {
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

    /// Every actor/site pairing that could be notified about the request.
    ///
    /// Seeds from the request's live requirements, then adds each per-site
    /// actor for every relevant site (the destination plus the current
    /// location of each vial in the request) and each study-wide actor once
    /// with no site. Duplicates are dropped by (actor, site) identity and the
    /// result is sorted case-insensitively by site label, siteless entries
    /// first, then by actor label. Pure read; no side effects.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown request.
    pub fn possible_recipients(&self, request_id: RequestId) -> RequestResult<Vec<RecipientSet>> {
        let state = self.store.read();
        let request = state
            .request(self.container, request_id)
            .cloned()
            .ok_or_else(|| RequestError::not_found(format!("request {}", request_id.0)))?;

        let mut seen: BTreeSet<(ActorId, Option<SiteId>)> = BTreeSet::new();
        let mut recipients: Vec<RecipientSet> = Vec::new();
        let mut push = |recipients: &mut Vec<RecipientSet>, set: RecipientSet| {
            if seen.insert(set.key()) {
                recipients.push(set);
            }
        };

        // 1. Actor/site pairs already referenced by the request's
        //    requirements.
        for requirement in state.requirements_for(request_id) {
            let Some(actor) = state.actor(self.container, requirement.actor_id) else {
                tracing::warn!(
                    actor = requirement.actor_id.0,
                    requirement = requirement.id.0,
                    "skipping requirement whose actor was deleted"
                );
                continue;
            };
            let site = requirement
                .site_id
                .and_then(|id| state.site(self.container, id))
                .cloned();
            push(
                &mut recipients,
                RecipientSet {
                    actor: actor.clone(),
                    site,
                },
            );
        }

        // 2. Relevant sites: destination plus the current location of every
        //    vial in the request.
        let mut relevant_sites: BTreeSet<SiteId> = BTreeSet::new();
        relevant_sites.insert(request.destination_site_id);
        let guids = state.vials_in_request(request_id);
        for vial in self.specimens.vials_by_ids(self.container, &guids) {
            if let Some(location) = vial.current_location_id {
                relevant_sites.insert(location);
            }
        }

        let mut actors: Vec<Actor> = state
            .actors
            .values()
            .filter(|a| a.container == self.container)
            .cloned()
            .collect();
        actors.sort_by_key(|a| (a.sort_order, a.id));

        for actor in &actors {
            if actor.is_per_site() {
                for site_id in &relevant_sites {
                    let Some(site) = state.site(self.container, *site_id) else {
                        continue;
                    };
                    push(
                        &mut recipients,
                        RecipientSet {
                            actor: actor.clone(),
                            site: Some(site.clone()),
                        },
                    );
                }
            } else {
                // 3. Study-wide actors appear once, with no site.
                push(
                    &mut recipients,
                    RecipientSet {
                        actor: actor.clone(),
                        site: None,
                    },
                );
            }
        }

        recipients.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(recipients)
    }
}
