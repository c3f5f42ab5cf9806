//! Actor registry: named roles that act on requests.
//!
//! An actor is either study-wide (one group for the whole study, e.g. an IRB)
//! or per-site (one group per location, e.g. a providing lab). Requirements
//! and notification recipients pattern-match on that scope rather than
//! branching on a flag.

use std::collections::HashMap;
use std::sync::Arc;

use srt_types::Label;

use crate::error::RequestResult;
use crate::model::{Actor, ActorId, ActorScope, ContainerId, RequirementOwner};
use crate::store::StudyStore;

/// Ordered actor list of one container.
pub struct ActorRegistry {
    store: Arc<StudyStore>,
    container: ContainerId,
}

impl ActorRegistry {
    pub fn new(store: Arc<StudyStore>, container: ContainerId) -> Self {
        Self { store, container }
    }

    /// All actors ordered by sort order.
    pub fn list(&self) -> Vec<Actor> {
        let state = self.store.read();
        let mut actors: Vec<Actor> = state
            .actors
            .values()
            .filter(|a| a.container == self.container)
            .cloned()
            .collect();
        actors.sort_by_key(|a| (a.sort_order, a.id));
        actors
    }

    pub fn actor(&self, id: ActorId) -> Option<Actor> {
        self.store.read().actor(self.container, id).cloned()
    }

    /// Creates a new actor appended at the end of the order.
    pub fn create(&self, label: Label, scope: ActorScope) -> RequestResult<Actor> {
        let mut state = self.store.write();
        let sort_order = state
            .actors
            .values()
            .filter(|a| a.container == self.container)
            .map(|a| a.sort_order + 1)
            .max()
            .unwrap_or(0);
        let id = ActorId(state.allocate_id());
        let actor = Actor {
            id,
            container: self.container,
            label,
            sort_order,
            scope,
        };
        state.actors.insert(id, actor.clone());
        Ok(actor)
    }

    /// Renames an actor. Unknown ids are a no-op.
    pub fn update(&self, id: ActorId, label: Label) -> RequestResult<()> {
        let mut state = self.store.write();
        let Some(existing) = state.actor(self.container, id).cloned() else {
            return Ok(());
        };
        state.actors.insert(id, Actor { label, ..existing });
        Ok(())
    }

    /// Reassigns sort orders so that each given id takes its index in the
    /// sequence; ids that do not resolve are left untouched. The id-to-actor
    /// map is snapshotted once before the loop.
    pub fn reorder(&self, ordered_ids: &[ActorId]) -> RequestResult<()> {
        let mut state = self.store.write();
        let by_id: HashMap<ActorId, Actor> = state
            .actors
            .values()
            .filter(|a| a.container == self.container)
            .cloned()
            .map(|a| (a.id, a))
            .collect();
        for (index, id) in ordered_ids.iter().enumerate() {
            let Some(actor) = by_id.get(id) else { continue };
            let sort_order = index as i32;
            if actor.sort_order != sort_order {
                let mut updated = actor.clone();
                updated.sort_order = sort_order;
                state.actors.insert(*id, updated);
            }
        }
        Ok(())
    }

    /// Deletes an actor. Unknown ids are a no-op.
    ///
    /// Requirements are part of the audit trail, so deleting an actor never
    /// cascades: live and historical requirements keep their (now dangling)
    /// actor reference for display purposes. Default templates referencing
    /// the actor are removed, since they would otherwise generate
    /// requirements no one can act on.
    pub fn delete(&self, id: ActorId) -> RequestResult<()> {
        let mut state = self.store.write();
        if state.actor(self.container, id).is_none() {
            return Ok(());
        }
        let orphaned = state
            .requirements
            .values()
            .filter(|r| r.container == self.container && r.actor_id == id)
            .filter(|r| matches!(r.owner, RequirementOwner::Request(_)))
            .count();
        if orphaned > 0 {
            tracing::warn!(
                actor = id.0,
                requirements = orphaned,
                "deleting actor referenced by live requirements; references kept for audit"
            );
        }
        state.requirements.retain(|_, r| {
            !(r.container == self.container
                && r.actor_id == id
                && r.owner == RequirementOwner::Template)
        });
        state.actors.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Requirement, RequirementId, RequirementKind, RequestId};

    fn registry() -> (Arc<StudyStore>, ActorRegistry) {
        let store = Arc::new(StudyStore::new());
        let registry = ActorRegistry::new(Arc::clone(&store), ContainerId(1));
        (store, registry)
    }

    fn label(text: &str) -> Label {
        Label::new(text).expect("valid label")
    }

    #[test]
    fn actors_list_in_creation_order() {
        let (_store, registry) = registry();
        registry
            .create(label("IRB"), ActorScope::StudyWide)
            .expect("create actor");
        registry
            .create(label("Providing Lab"), ActorScope::PerSite)
            .expect("create actor");

        let labels: Vec<String> = registry
            .list()
            .iter()
            .map(|a| a.label.as_str().to_owned())
            .collect();
        assert_eq!(labels, vec!["IRB", "Providing Lab"]);
    }

    #[test]
    fn reorder_moves_known_ids_only() {
        let (_store, registry) = registry();
        let a = registry
            .create(label("A"), ActorScope::StudyWide)
            .expect("create actor");
        let b = registry
            .create(label("B"), ActorScope::StudyWide)
            .expect("create actor");

        registry
            .reorder(&[b.id, ActorId(777), a.id])
            .expect("reorder");

        let labels: Vec<String> = registry
            .list()
            .iter()
            .map(|a| a.label.as_str().to_owned())
            .collect();
        assert_eq!(labels, vec!["B", "A"]);
    }

    #[test]
    fn delete_keeps_live_requirements_but_drops_templates() {
        let (store, registry) = registry();
        let actor = registry
            .create(label("QA"), ActorScope::StudyWide)
            .expect("create actor");

        {
            let mut state = store.write();
            let template_id = RequirementId(state.allocate_id());
            state.requirements.insert(
                template_id,
                Requirement {
                    id: template_id,
                    container: ContainerId(1),
                    owner: RequirementOwner::Template,
                    kind: RequirementKind::NonSite,
                    actor_id: actor.id,
                    site_id: None,
                    description: "Approval".to_owned(),
                    complete: false,
                },
            );
            let live_id = RequirementId(state.allocate_id());
            state.requirements.insert(
                live_id,
                Requirement {
                    id: live_id,
                    container: ContainerId(1),
                    owner: RequirementOwner::Request(RequestId(10)),
                    kind: RequirementKind::NonSite,
                    actor_id: actor.id,
                    site_id: None,
                    description: "Approval".to_owned(),
                    complete: true,
                },
            );
        }

        registry.delete(actor.id).expect("delete actor");

        let state = store.read();
        assert!(state.actors.is_empty());
        let remaining: Vec<&Requirement> = state.requirements.values().collect();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].owner,
            RequirementOwner::Request(RequestId(10)),
            "the live requirement survives with its dangling actor reference"
        );
    }

    #[test]
    fn deleting_unknown_actor_is_a_no_op() {
        let (_store, registry) = registry();
        registry.delete(ActorId(5)).expect("no-op delete");
    }
}
